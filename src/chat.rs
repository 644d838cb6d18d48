//! Read-only Telegram front-end: reports ledger stats and worker status.
//! Never mutates worker or ledger state — every command is a query against
//! data the supervisor already owns.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use log::{error, warn};
use teloxide::prelude::*;
use teloxide::utils::command::BotCommands;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::errors::{PortalError, PortalResult};
use crate::ledger::TradeLedger;
use crate::model::TelegramSettings;
use crate::time::utc_day_start_ts;

#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase", description = "Read-only status commands:")]
enum ChatCommand {
    #[command(description = "show this help message")]
    Start,
    #[command(description = "all-time profit stats")]
    Stats,
    #[command(description = "profit stats since UTC day start")]
    Today,
    #[command(description = "10 most recent open positions")]
    Positions,
    #[command(description = "10 most recent trade events")]
    Last,
    #[command(description = "per-worker status snapshot")]
    Workers,
}

#[derive(Clone)]
struct ChatState {
    ledger: Arc<TradeLedger>,
    statuses: Arc<HashMap<String, Arc<StdMutex<String>>>>,
    allow_list: Arc<Vec<ChatId>>,
}

impl ChatState {
    fn is_allowed(&self, chat_id: ChatId) -> bool {
        self.allow_list.is_empty() || self.allow_list.contains(&chat_id)
    }

    fn account_names(&self) -> Vec<String> {
        self.statuses.keys().cloned().collect()
    }

    async fn stats_text(&self, since_ts: Option<i64>) -> String {
        let mut total = crate::ledger::ProfitStats::default();
        let mut open_positions = 0usize;
        for account in self.account_names() {
            match self.ledger.get_profit_stats(&account, since_ts).await {
                Ok(stats) => {
                    total.buy_count += stats.buy_count;
                    total.sell_count += stats.sell_count;
                    total.total_buy += stats.total_buy;
                    total.total_sell += stats.total_sell;
                    total.total_fee += stats.total_fee;
                    total.net_profit += stats.net_profit;
                    total.realized_profit += stats.realized_profit;
                }
                Err(e) => warn!("stats query failed for {account}: {e}"),
            }
            if let Ok(positions) = self.ledger.get_open_positions(&account).await {
                open_positions += positions.len();
            }
        }
        format!(
            "buys={} sells={} total_buy={} total_sell={} total_fee={} net_profit={} realized_profit={} open_positions={}",
            total.buy_count,
            total.sell_count,
            total.total_buy,
            total.total_sell,
            total.total_fee,
            total.net_profit,
            total.realized_profit,
            open_positions
        )
    }

    async fn positions_text(&self) -> String {
        let mut rows = Vec::new();
        for account in self.account_names() {
            if let Ok(positions) = self.ledger.get_open_positions(&account).await {
                rows.extend(positions);
            }
        }
        rows.sort_by_key(|p| std::cmp::Reverse(p.buy_ts));
        rows.truncate(10);
        if rows.is_empty() {
            return "no open positions".to_string();
        }
        rows.iter()
            .map(|p| format!("{} {} buy={} @ {}", p.account, p.nft_id, p.buy_price, p.buy_ts))
            .collect::<Vec<_>>()
            .join("\n")
    }

    async fn last_events_text(&self) -> String {
        let mut rows = Vec::new();
        for account in self.account_names() {
            if let Ok(events) = self.ledger.get_recent_events(&account, 10).await {
                rows.extend(events);
            }
        }
        rows.sort_by_key(|e| std::cmp::Reverse(e.ts));
        rows.truncate(10);
        if rows.is_empty() {
            return "no events yet".to_string();
        }
        rows.iter()
            .map(|e| format!("{} {} {} @ {} ({})", e.account, e.kind.as_str(), e.nft_id, e.price, e.ts))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn workers_text(&self) -> String {
        if self.statuses.is_empty() {
            return "no workers running".to_string();
        }
        let mut lines: Vec<String> = self
            .statuses
            .iter()
            .map(|(name, status)| format!("{name}: {}", status.lock().unwrap()))
            .collect();
        lines.sort();
        lines.join("\n")
    }
}

async fn handle_command(bot: Bot, msg: Message, cmd: ChatCommand, state: ChatState) -> ResponseResult<()> {
    if !state.is_allowed(msg.chat.id) {
        return Ok(());
    }
    let text = match cmd {
        ChatCommand::Start => ChatCommand::descriptions().to_string(),
        ChatCommand::Stats => state.stats_text(None).await,
        ChatCommand::Today => state.stats_text(Some(utc_day_start_ts())).await,
        ChatCommand::Positions => state.positions_text().await,
        ChatCommand::Last => state.last_events_text().await,
        ChatCommand::Workers => state.workers_text(),
    };
    bot.send_message(msg.chat.id, text).await?;
    Ok(())
}

pub struct ChatCollaborator {
    settings: TelegramSettings,
    ledger: Arc<TradeLedger>,
    statuses: HashMap<String, Arc<StdMutex<String>>>,
    notify_rx: mpsc::Receiver<String>,
    cancel: CancellationToken,
}

impl ChatCollaborator {
    pub fn new(
        settings: TelegramSettings,
        ledger: Arc<TradeLedger>,
        statuses: HashMap<String, Arc<StdMutex<String>>>,
        notify_rx: mpsc::Receiver<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            settings,
            ledger,
            statuses,
            notify_rx,
            cancel,
        }
    }

    pub async fn spawn(self) -> PortalResult<JoinHandle<()>> {
        if self.settings.token.trim().is_empty() {
            return Err(PortalError::Config("telegram token is empty".into()));
        }
        let bot = Bot::new(self.settings.token.clone());

        let allow_list: Vec<ChatId> = self.settings.chat_ids.iter().map(|id| ChatId(*id)).collect();
        let state = ChatState {
            ledger: self.ledger,
            statuses: Arc::new(self.statuses),
            allow_list: Arc::new(allow_list.clone()),
        };

        let handler = Update::filter_message().filter_command::<ChatCommand>().endpoint(handle_command);
        let mut dispatcher = Dispatcher::builder(bot.clone(), handler)
            .dependencies(dptree::deps![state])
            .default_handler(|_upd| async move {})
            .build();

        let cancel = self.cancel;
        let mut notify_rx = self.notify_rx;

        Ok(tokio::spawn(async move {
            let dispatch_cancel = cancel.clone();
            let dispatch = tokio::spawn(async move {
                tokio::select! {
                    _ = dispatcher.dispatch() => {},
                    _ = dispatch_cancel.cancelled() => {},
                }
            });

            let sender_bot = bot;
            let sender_allow_list = allow_list;
            let sender_cancel = cancel.clone();
            let sender = tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = sender_cancel.cancelled() => break,
                        maybe_text = notify_rx.recv() => {
                            let Some(text) = maybe_text else { break };
                            for chat_id in &sender_allow_list {
                                if let Err(e) = sender_bot.send_message(*chat_id, text.clone()).await {
                                    error!("failed to deliver notification to {chat_id}: {e}");
                                }
                            }
                        }
                    }
                }
            });

            let _ = tokio::join!(dispatch, sender);
        }))
    }
}
