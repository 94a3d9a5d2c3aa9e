use app::prelude::*;
use utils::app_config::AppConfig;
use utils::error::Error;

pub async fn sync_cmd(
    source: String, target: String, password: Option<String>,
) -> utils::error::Result<()> {
    let config = AppConfig::fetch()?.sync;

    let params = SyncParams {
        source,
        target,
        delete_missing: config.delete_missing,
        checksum: config.checksum,
        identity_file: config.identity_file.filter(|f| !f.is_empty()),
        port: config.port,
        password,
        connect_timeout: config.connect_timeout,
    };

    log::debug!("comparing by {:?}, delete missing: {}", params.strategy(), params.delete_missing);

    match Syncer::new(params).sync().await {
        Ok(stats) => {
            log::info!("Synchronization completed");
            log::info!(
                "copied {}, updated {}, deleted {}, unchanged {}, errors {}, {} bytes",
                stats.copied,
                stats.updated,
                stats.deleted,
                stats.unchanged,
                stats.errors,
                stats.bytes
            );
            Ok(())
        }
        Err(e) => {
            log::error!("Synchronization failed: {}", e);
            Err(Error::with_source("Synchronization failed", Box::new(e)))
        }
    }
}
