//! Periodic hello emission. Not started when `client` mode is set; such
//! instances listen only.

use tracing::debug;

use crate::dispatch::build_hello_data;
use crate::Discover;

pub fn spawn(discover: Discover) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let (is_master, is_master_eligible) = {
                let state = discover.state.lock().await;
                (state.is_master, state.is_master_eligible)
            };

            let interval = {
                let options = discover.options.lock().await;
                let data = build_hello_data(
                    is_master,
                    is_master_eligible,
                    options.weight,
                    &options.bind_address,
                    options.advertisement.as_ref(),
                );
                drop(options);

                if discover.emit("hello", data).await.is_ok() {
                    if let Some(cb) = discover.observers.lock().await.hello_emitted.clone() {
                        cb(&discover);
                    }
                } else {
                    debug!("hello emission skipped: transport not bound");
                }

                discover.options.lock().await.hello_interval
            };

            tokio::select! {
                _ = discover.cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    })
}
