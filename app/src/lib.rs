pub mod sync;

/// 公共API的prelude模块，`use app::prelude::*` 即可发起一次同步
pub mod prelude {
    pub use crate::sync::compare::CompareStrategy;
    pub use crate::sync::report::{LogReporter, Reporter};
    pub use crate::sync::{SyncError, SyncParams, SyncStats, Syncer};
}
