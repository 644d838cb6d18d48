//! Spawns one [`AccountWorker`] per configured account, shares the trade
//! ledger across them, and owns the chat collaborator's lifecycle.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use log::{info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::chat::ChatCollaborator;
use crate::errors::PortalResult;
use crate::ledger::TradeLedger;
use crate::market_api::{MarketApi, PortalApiClient};
use crate::model::AppConfig;
use crate::worker::{AccountWorker, WorkerRules};

const NOTIFY_QUEUE_CAPACITY: usize = 2000;
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(8);

pub struct PortalEngine {
    ledger: Arc<TradeLedger>,
    statuses: HashMap<String, Arc<StdMutex<String>>>,
    worker_handles: Vec<JoinHandle<()>>,
    chat_handle: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl PortalEngine {
    pub async fn start(config: AppConfig) -> PortalResult<Self> {
        let ledger = Arc::new(TradeLedger::open(&config.state_db_path).await?);
        let cancel = CancellationToken::new();
        let (notify_tx, notify_rx) = mpsc::channel(NOTIFY_QUEUE_CAPACITY);

        let mut statuses = HashMap::new();
        let mut worker_handles = Vec::new();

        for account in &config.accounts {
            let api: Arc<dyn MarketApi> = Arc::new(PortalApiClient::new(
                config.api_base.clone(),
                config.routes.clone(),
                account.auth.clone(),
                Duration::from_secs_f64(config.runtime.request_timeout),
            ));
            let rules = WorkerRules {
                offer_rules: config.offer_rules.clone(),
                order_rules: config.order_rules.clone(),
                sell_rules: config.sell_rules.clone(),
                liquidity: config.liquidity.clone(),
                runtime: config.runtime.clone(),
            };
            let status = Arc::new(StdMutex::new("booting".to_string()));
            statuses.insert(account.name.clone(), status.clone());

            let worker = AccountWorker::new(
                account.clone(),
                api,
                ledger.clone(),
                rules,
                notify_tx.clone(),
                status,
                cancel.clone(),
            );
            worker_handles.push(tokio::spawn(worker.run()));
        }

        let chat_handle = if config.telegram.enabled && !config.telegram.token.is_empty() {
            let collaborator = ChatCollaborator::new(
                config.telegram.clone(),
                ledger.clone(),
                statuses.clone(),
                notify_rx,
                cancel.clone(),
            );
            match collaborator.spawn().await {
                Ok(handle) => Some(handle),
                Err(e) => {
                    warn!("chat collaborator failed to start, continuing without it: {e}");
                    None
                }
            }
        } else {
            drop(notify_rx);
            None
        };

        Ok(Self {
            ledger,
            statuses,
            worker_handles,
            chat_handle,
            cancel,
        })
    }

    pub fn ledger(&self) -> Arc<TradeLedger> {
        self.ledger.clone()
    }

    pub fn status_snapshot(&self) -> HashMap<String, String> {
        self.statuses
            .iter()
            .map(|(name, status)| (name.clone(), status.lock().unwrap().clone()))
            .collect()
    }

    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        for handle in self.worker_handles.drain(..) {
            if timeout(SHUTDOWN_TIMEOUT, handle).await.is_err() {
                warn!("worker did not stop within shutdown timeout");
            }
        }
        if let Some(handle) = self.chat_handle.take() {
            handle.abort();
        }
        info!("engine shut down");
    }
}
