//! Wire types for the Client Portal Web API.

use chrono::{TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::models::{Bar, Instrument, OrderSide, SecType};

/// The gateway sends ids and prices either as JSON numbers or strings.
fn flexible_i64<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| serde::de::Error::custom(format!("not an integer: {}", n))),
        Value::String(s) => s.trim().parse().map_err(serde::de::Error::custom),
        other => Err(serde::de::Error::custom(format!("expected id, got {}", other))),
    }
}

fn flexible_decimal<'de, D>(deserializer: D) -> Result<Option<Decimal>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Number(n) => n.as_f64().and_then(|f| Decimal::try_from(f).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

/// /iserver/auth/status
#[derive(Debug, Clone, Deserialize)]
pub struct AuthStatus {
    #[serde(default)]
    pub authenticated: bool,
    #[serde(default)]
    pub connected: bool,
    #[serde(default)]
    pub competing: bool,
}

/// /portfolio/accounts
#[derive(Debug, Clone, Deserialize)]
pub struct AccountEntry {
    pub id: String,
}

/// /iserver/secdef/search
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecdefSearchEntry {
    #[serde(deserialize_with = "flexible_i64")]
    pub conid: i64,
    #[serde(default)]
    pub sections: Vec<SecdefSection>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecdefSection {
    pub sec_type: String,
}

impl SecdefSearchEntry {
    pub fn offers(&self, sec_type: SecType) -> bool {
        self.sections
            .iter()
            .any(|s| SecType::parse(&s.sec_type) == sec_type)
    }
}

/// /hmds/history
#[derive(Debug, Clone, Deserialize)]
pub struct HistoryResponse {
    #[serde(default)]
    pub data: Vec<HistoryBar>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryBar {
    /// Epoch milliseconds
    pub t: i64,
    pub o: f64,
    pub h: f64,
    pub l: f64,
    pub c: f64,
    #[serde(default)]
    pub v: f64,
}

impl HistoryBar {
    pub fn into_bar(self) -> Option<Bar> {
        let time = Utc.timestamp_millis_opt(self.t).single()?;
        Some(Bar {
            time,
            open: self.o,
            high: self.h,
            low: self.l,
            close: self.c,
            volume: self.v,
        })
    }
}

/// /portfolio/{account}/positions/{page}
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionEntry {
    #[serde(deserialize_with = "flexible_i64")]
    pub conid: i64,
    #[serde(default)]
    pub contract_desc: String,
    #[serde(default)]
    pub ticker: Option<String>,
    pub position: f64,
    #[serde(default)]
    pub avg_cost: f64,
    #[serde(default)]
    pub unrealized_pnl: f64,
    #[serde(default)]
    pub mkt_price: Option<f64>,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub asset_class: String,
    #[serde(default)]
    pub listing_exchange: Option<String>,
}

impl PositionEntry {
    pub fn instrument(&self) -> Instrument {
        let sec_type = SecType::parse(&self.asset_class);
        let symbol = self
            .ticker
            .clone()
            .unwrap_or_else(|| self.contract_desc.clone());

        let mut instrument = match sec_type {
            SecType::Cash => Instrument::forex(&symbol),
            _ => Instrument::stock(&symbol, "SMART", &self.currency),
        };
        instrument.sec_type = sec_type;
        if let Some(exchange) = &self.listing_exchange {
            if sec_type != SecType::Cash {
                instrument.exchange = exchange.clone();
            }
        }
        instrument.with_con_id(self.conid)
    }
}

/// /iserver/account/orders
#[derive(Debug, Clone, Deserialize)]
pub struct OrdersResponse {
    #[serde(default)]
    pub orders: Vec<OrderEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderEntry {
    #[serde(deserialize_with = "flexible_i64")]
    pub order_id: i64,
    #[serde(deserialize_with = "flexible_i64")]
    pub conid: i64,
    #[serde(default)]
    pub ticker: String,
    #[serde(default)]
    pub sec_type: String,
    #[serde(default)]
    pub listing_exchange: Option<String>,
    #[serde(default)]
    pub cash_ccy: Option<String>,
    pub side: String,
    #[serde(default)]
    pub total_size: f64,
    #[serde(default, deserialize_with = "flexible_decimal")]
    pub price: Option<Decimal>,
    #[serde(default)]
    pub order_type: String,
    pub status: String,
}

impl OrderEntry {
    pub fn instrument(&self) -> Instrument {
        let sec_type = SecType::parse(&self.sec_type);
        let currency = self.cash_ccy.clone().unwrap_or_else(|| "USD".to_string());

        let mut instrument = match sec_type {
            SecType::Cash => Instrument::forex(&self.ticker),
            _ => Instrument::stock(
                &self.ticker,
                self.listing_exchange.as_deref().unwrap_or("SMART"),
                &currency,
            ),
        };
        instrument.sec_type = sec_type;
        instrument.with_con_id(self.conid)
    }

    pub fn side(&self) -> Option<OrderSide> {
        OrderSide::parse(&self.side)
    }
}

/// One leg of an order placement request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderTicket {
    pub acct_id: String,
    pub conid: i64,
    #[serde(rename = "cOID")]
    pub c_oid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub order_type: String,
    pub listing_exchange: String,
    #[serde(rename = "outsideRTH")]
    pub outside_rth: bool,
    #[serde(
        skip_serializing_if = "Option::is_none",
        with = "rust_decimal::serde::float_option"
    )]
    pub price: Option<Decimal>,
    pub side: String,
    pub tif: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub quantity: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlaceOrdersRequest {
    pub orders: Vec<OrderTicket>,
}

/// Placement either succeeds or asks for confirmation of warnings.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PlaceOrderReply {
    Placed {
        #[serde(deserialize_with = "flexible_i64")]
        order_id: i64,
        #[serde(default)]
        order_status: String,
    },
    Confirm {
        id: String,
        #[serde(default)]
        message: Vec<String>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplyConfirmation {
    pub confirmed: bool,
}

/// /iserver/scanner/run
#[derive(Debug, Clone, Serialize)]
pub struct ScannerRunRequest {
    pub instrument: String,
    pub location: String,
    #[serde(rename = "type")]
    pub scan_type: String,
    pub filter: Vec<ScannerFilter>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScannerFilter {
    pub code: String,
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScannerRunResponse {
    #[serde(default)]
    pub contracts: Vec<ScannerContract>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScannerContract {
    #[serde(deserialize_with = "flexible_i64")]
    pub con_id: i64,
    pub symbol: String,
    #[serde(default)]
    pub listing_exchange: Option<String>,
    #[serde(default)]
    pub sec_type: Option<String>,
}

impl ScannerContract {
    pub fn instrument(&self) -> Instrument {
        let mut instrument = Instrument::stock(
            &self.symbol,
            self.listing_exchange.as_deref().unwrap_or("SMART"),
            "USD",
        );
        if let Some(sec_type) = &self.sec_type {
            instrument.sec_type = SecType::parse(sec_type);
        }
        instrument.with_con_id(self.con_id)
    }
}

/// Convert "7 D" / "2 W" / "1 M" / "1 Y" to the gateway period format.
pub fn history_period(duration: &str) -> String {
    let (amount, unit) = split_amount(duration);
    let unit = match unit.to_uppercase().as_str() {
        "S" => "s",
        "W" => "w",
        "M" => "m",
        "Y" => "y",
        _ => "d",
    };
    format!("{}{}", amount, unit)
}

/// Convert "5 mins" / "1 hour" / "1 day" to the gateway bar format.
pub fn history_bar(bar_size: &str) -> String {
    let (amount, unit) = split_amount(bar_size);
    let unit = match unit.to_lowercase().trim_end_matches('s') {
        "sec" | "second" => "s",
        "hour" => "h",
        "day" => "d",
        "week" => "w",
        "month" => "m",
        _ => "min",
    };
    format!("{}{}", amount, unit)
}

fn split_amount(s: &str) -> (u32, String) {
    let s = s.trim();
    let digits: String = s.chars().take_while(|c| c.is_ascii_digit()).collect();
    let unit = s[digits.len()..].trim().to_string();
    (digits.parse().unwrap_or(1), unit)
}

/// Map a price type to the history `source` parameter.
pub fn history_source(price_type: &str) -> &'static str {
    match price_type.to_uppercase().as_str() {
        "TRADES" => "Trades",
        "BID_ASK" | "BID" | "ASK" => "Bid_Ask",
        _ => "Midpoint",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_history_parameters() {
        assert_eq!(history_period("7 D"), "7d");
        assert_eq!(history_period("2 W"), "2w");
        assert_eq!(history_bar("5 mins"), "5min");
        assert_eq!(history_bar("1 hour"), "1h");
        assert_eq!(history_bar("1 day"), "1d");
        assert_eq!(history_source("MIDPOINT"), "Midpoint");
        assert_eq!(history_source("trades"), "Trades");
    }

    #[test]
    fn test_parse_history() {
        let json = r#"{"symbol":"EUR.USD","data":[
            {"t":1714996800000,"o":1.0761,"h":1.0765,"l":1.0759,"c":1.0763,"v":0},
            {"t":1714997100000,"o":1.0763,"h":1.0768,"l":1.0762,"c":1.0767}
        ]}"#;
        let history: HistoryResponse = serde_json::from_str(json).unwrap();
        let bars: Vec<Bar> = history.data.into_iter().filter_map(HistoryBar::into_bar).collect();

        assert_eq!(bars.len(), 2);
        assert_eq!(bars[1].high, 1.0768);
        assert_eq!(bars[1].volume, 0.0);
        assert!(bars[0].time < bars[1].time);
    }

    #[test]
    fn test_parse_positions_and_orders() {
        let json = r#"[{"acctId":"DU1","conid":"265598","contractDesc":"AAPL","ticker":"AAPL",
            "position":10.0,"avgCost":180.5,"unrealizedPnl":-12.25,"currency":"USD",
            "assetClass":"STK","listingExchange":"NASDAQ"}]"#;
        let positions: Vec<PositionEntry> = serde_json::from_str(json).unwrap();
        let instrument = positions[0].instrument();
        assert_eq!(instrument.con_id, Some(265598));
        assert_eq!(instrument.exchange, "NASDAQ");

        let json = r#"{"orders":[{"orderId":1234,"conid":12087792,"ticker":"EUR.USD",
            "secType":"CASH","side":"BUY","totalSize":1.0,"price":"1.0812",
            "orderType":"Limit","status":"PreSubmitted","cashCcy":"USD"}]}"#;
        let orders: OrdersResponse = serde_json::from_str(json).unwrap();
        let order = &orders.orders[0];
        assert_eq!(order.price, Some(dec!(1.0812)));
        assert_eq!(order.side(), Some(OrderSide::Buy));
        assert_eq!(order.instrument().symbol, "EUR");
        assert_eq!(order.instrument().sec_type, SecType::Cash);
    }

    #[test]
    fn test_place_order_reply_variants() {
        let placed: Vec<PlaceOrderReply> =
            serde_json::from_str(r#"[{"order_id":"987","order_status":"Submitted"}]"#).unwrap();
        assert!(matches!(placed[0], PlaceOrderReply::Placed { order_id: 987, .. }));

        let confirm: Vec<PlaceOrderReply> =
            serde_json::from_str(r#"[{"id":"07a13a5a","message":["Price exceeds the cap"]}]"#).unwrap();
        assert!(matches!(&confirm[0], PlaceOrderReply::Confirm { id, .. } if id == "07a13a5a"));
    }

    #[test]
    fn test_ticket_serialization() {
        let ticket = OrderTicket {
            acct_id: "DU1".to_string(),
            conid: 265598,
            c_oid: "1-parent".to_string(),
            parent_id: None,
            order_type: "LMT".to_string(),
            listing_exchange: "SMART".to_string(),
            outside_rth: false,
            price: Some(dec!(101.5)),
            side: "BUY".to_string(),
            tif: "GTC".to_string(),
            quantity: dec!(1),
        };
        let json = serde_json::to_value(&ticket).unwrap();
        assert_eq!(json["cOID"], "1-parent");
        assert_eq!(json["outsideRTH"], false);
        assert!(json.get("parentId").is_none());
        assert_eq!(json["price"], 101.5);
    }
}
