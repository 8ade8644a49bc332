/// Daily trade fetch and journal rendering

use crate::broker::session::{authorization, BrokerSession, KITE_VERSION, KITE_VERSION_HEADER};
use crate::error::{Error, Result};
use chrono::{Local, NaiveDateTime};
use reqwest::header::AUTHORIZATION;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Deserializer};
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One executed trade as reported by the provider
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Trade {
    #[serde(default)]
    pub trade_id: String,
    #[serde(default)]
    pub order_id: String,
    #[serde(rename = "tradingsymbol")]
    pub trading_symbol: String,
    #[serde(default)]
    pub exchange: String,
    /// BUY or SELL
    pub transaction_type: String,
    #[serde(default)]
    pub product: String,
    /// Parsed from the shortest decimal form of the JSON number, so `0.30005` stays exact
    pub average_price: Decimal,
    pub quantity: i64,
    #[serde(deserialize_with = "provider_timestamp")]
    pub fill_timestamp: NaiveDateTime,
}

fn provider_timestamp<'de, D>(deserializer: D) -> std::result::Result<NaiveDateTime, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    NaiveDateTime::parse_from_str(&raw, TIMESTAMP_FORMAT).map_err(|e| {
        serde::de::Error::custom(format!("unable to parse timestamp {raw}: {e}"))
    })
}

#[derive(Debug, Deserialize)]
struct TradesResponse {
    status: String,
    #[serde(default)]
    data: Vec<Trade>,
}

impl BrokerSession {
    /// Today's trades for the account; aborts when `cancel` fires.
    pub async fn fetch_trades(
        &self,
        api_key: &str,
        access_token: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<Trade>> {
        let request = self
            .client
            .get(self.endpoints.trades_url())
            .header(KITE_VERSION_HEADER, KITE_VERSION)
            .header(AUTHORIZATION, authorization(api_key, access_token))
            .send();

        let response = tokio::select! {
            response = request => response?,
            _ = cancel.cancelled() => {
                return Err(Error::Task("trade fetch cancelled".to_string()));
            }
        };

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(Error::Task(format!(
                "trades request failed with status {status}: {body}"
            )));
        }

        let parsed: TradesResponse = serde_json::from_str(&body)
            .map_err(|e| Error::Protocol(format!("failed to parse trades response: {e}")))?;
        if parsed.status != "success" {
            return Err(Error::Task(format!(
                "trades API returned status {}",
                parsed.status
            )));
        }
        Ok(parsed.data)
    }
}

/// Ledger posting for one trade, `None` for transaction types we do not book
pub fn ledger_entry(trade: &Trade) -> Option<String> {
    let (quantity, description) = match trade.transaction_type.as_str() {
        "BUY" => (
            trade.quantity,
            format!("Purchased {} Shares of {}", trade.quantity, trade.trading_symbol),
        ),
        "SELL" => (
            -trade.quantity,
            format!("Sold {} Shares of {}", trade.quantity, trade.trading_symbol),
        ),
        other => {
            warn!("Unknown transaction type: {}", other);
            return None;
        }
    };

    Some(format!(
        "{} {}\n    Assets:Equity:Stocks:{}\t\t\t{} \"{}\" @ {} INR\n    Assets:Checking:Broker:Zerodha",
        trade.fill_timestamp.format("%Y/%m/%d"),
        description,
        trade.trading_symbol,
        quantity,
        trade.trading_symbol,
        format_price(trade.average_price),
    ))
}

/// Rounded half away from zero to 4 places, trailing zeros dropped
fn format_price(price: Decimal) -> String {
    price
        .round_dp_with_strategy(4, RoundingStrategy::MidpointAwayFromZero)
        .normalize()
        .to_string()
}

/// Append the account's trades to the journal; returns how many were written.
pub async fn append_to_journal(journal: &Path, account_name: &str, trades: &[Trade]) -> Result<usize> {
    let now = Local::now();
    let header = format!(
        "; Auto added on {} {} - {}",
        now.format("%Y-%m-%d"),
        now.format("%-I:%M %p"),
        account_name
    );

    let entries: Vec<String> = trades
        .iter()
        .filter_map(ledger_entry)
        .map(|entry| format!("{} \n{}", header, entry))
        .collect();

    if entries.is_empty() {
        info!("No ledger entries generated for {}", account_name);
        return Ok(0);
    }

    let section = format!("\n{}\n", entries.join("\n\n"));
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(journal)
        .await
        .map_err(|e| Error::Task(format!("failed to open journal {}: {e}", journal.display())))?;
    file.write_all(section.as_bytes())
        .await
        .map_err(|e| Error::Task(format!("failed to write journal {}: {e}", journal.display())))?;
    file.flush()
        .await
        .map_err(|e| Error::Task(format!("failed to write journal {}: {e}", journal.display())))?;

    info!("📒 Added {} trade entries for {}", entries.len(), account_name);
    Ok(entries.len())
}
