//! Interactive Brokers Client Portal gateway client.
//!
//! Talks to a locally running Client Portal gateway over HTTPS. The gateway
//! keeps the brokerage session; this client only checks that the session is
//! authenticated, then reads portfolio/market state and places orders.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::models::{
    AccountValue, Bar, Instrument, LiveOrder, OrderIntent, OrderKind, OrderSide, OrderStatus,
    Position, SecType,
};

use super::types::*;
use super::{BarRequest, BrokerGateway, GatewayEndpoint, GatewayError, GatewayResult, ScannerSubscription};

const API_PREFIX: &str = "/v1/api";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// Placement warnings confirmed automatically before giving up.
const MAX_REPLY_ROUNDS: usize = 3;

/// Client for the Client Portal Web API.
pub struct ClientPortalGateway {
    http: Client,
    base_url: RwLock<String>,
    account_id: RwLock<Option<String>>,
    client_id: RwLock<i32>,
    connected: AtomicBool,
}

impl ClientPortalGateway {
    /// Create a client. `accept_invalid_certs` is needed for the gateway's self-signed certificate.
    pub fn new(account_id: Option<String>, accept_invalid_certs: bool) -> GatewayResult<Self> {
        let http = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()?;

        Ok(Self {
            http,
            base_url: RwLock::new(String::new()),
            account_id: RwLock::new(account_id),
            client_id: RwLock::new(0),
            connected: AtomicBool::new(false),
        })
    }

    async fn url(&self, path: &str) -> String {
        format!("{}{}{}", self.base_url.read().await, API_PREFIX, path)
    }

    async fn request<B, T>(&self, method: Method, path: &str, body: Option<&B>) -> GatewayResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        if self.base_url.read().await.is_empty() {
            return Err(GatewayError::NotConnected);
        }

        let url = self.url(path).await;
        debug!(method = %method, url = %url, "Gateway request");

        let mut builder = self.http.request(method, &url);
        if let Some(body) = body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_connect() {
                GatewayError::Connectivity(e.to_string())
            } else {
                GatewayError::Http(e)
            }
        })?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(GatewayError::Api {
                status: status.as_u16(),
                body: text,
            });
        }

        serde_json::from_str(&text).map_err(|e| GatewayError::Decode(format!("{}: {}", path, e)))
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> GatewayResult<T> {
        self.request::<(), T>(Method::GET, path, None).await
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(&self, path: &str, body: &B) -> GatewayResult<T> {
        self.request(Method::POST, path, Some(body)).await
    }

    /// Account id from configuration, or the first account the session can see.
    async fn account(&self) -> GatewayResult<String> {
        if let Some(id) = self.account_id.read().await.clone() {
            return Ok(id);
        }

        let accounts: Vec<AccountEntry> = self.get("/portfolio/accounts").await?;
        let id = accounts
            .into_iter()
            .next()
            .map(|a| a.id)
            .ok_or_else(|| GatewayError::Decode("no accounts available".to_string()))?;

        info!(account = %id, "Using gateway account");
        *self.account_id.write().await = Some(id.clone());
        Ok(id)
    }

    async fn qualify_one(&self, instrument: &Instrument) -> GatewayResult<Option<Instrument>> {
        if instrument.is_qualified() {
            return Ok(Some(instrument.clone()));
        }

        let symbol = match instrument.sec_type {
            SecType::Cash => format!("{}.{}", instrument.symbol, instrument.currency),
            _ => instrument.symbol.clone(),
        };
        let path = format!(
            "/iserver/secdef/search?symbol={}&secType={}",
            symbol,
            instrument.sec_type.as_str()
        );

        let results: Vec<SecdefSearchEntry> = self.get(&path).await?;
        let found = results
            .iter()
            .find(|r| r.offers(instrument.sec_type))
            .or_else(|| results.first());

        Ok(found.map(|r| instrument.clone().with_con_id(r.conid)))
    }

    async fn order_snapshot(&self) -> GatewayResult<Vec<LiveOrder>> {
        let response: OrdersResponse = self.get("/iserver/account/orders").await?;

        Ok(response
            .orders
            .into_iter()
            .filter_map(|o| {
                let side = match o.side() {
                    Some(side) => side,
                    None => {
                        warn!(order_id = o.order_id, side = %o.side, "Unknown order side");
                        return None;
                    }
                };
                Some(LiveOrder {
                    order_id: o.order_id.to_string(),
                    status: OrderStatus::parse(&o.status),
                    instrument: o.instrument(),
                    side,
                    quantity: Decimal::try_from(o.total_size).unwrap_or(Decimal::ZERO),
                    order_type: o.order_type.clone(),
                    limit_price: o.price,
                })
            })
            .collect())
    }

    async fn tickets_for(&self, instrument: &Instrument, intent: &OrderIntent) -> GatewayResult<Vec<OrderTicket>> {
        let account = self.account().await?;
        let con_id = instrument
            .con_id
            .ok_or_else(|| GatewayError::Decode(format!("{} is not qualified", instrument)))?;
        let client_id = *self.client_id.read().await;
        let parent_ref = format!("{}-{}", client_id, uuid::Uuid::new_v4());

        let ticket = |c_oid: String, parent_id: Option<String>, order_type: &str, side: OrderSide, price: Option<Decimal>| {
            OrderTicket {
                acct_id: account.clone(),
                conid: con_id,
                c_oid,
                parent_id,
                order_type: order_type.to_string(),
                listing_exchange: instrument.exchange.clone(),
                outside_rth: false,
                price,
                side: side.as_str().to_string(),
                tif: "GTC".to_string(),
                quantity: intent.quantity,
            }
        };

        Ok(match &intent.kind {
            OrderKind::Market => vec![ticket(parent_ref, None, "MKT", intent.side, None)],
            OrderKind::Bracket {
                limit_price,
                take_profit,
                stop_loss,
            } => {
                let exit_side = intent.side.opposite();
                vec![
                    ticket(parent_ref.clone(), None, "LMT", intent.side, Some(*limit_price)),
                    ticket(format!("{}-tp", parent_ref), Some(parent_ref.clone()), "LMT", exit_side, Some(*take_profit)),
                    ticket(format!("{}-sl", parent_ref), Some(parent_ref), "STP", exit_side, Some(*stop_loss)),
                ]
            }
        })
    }
}

#[async_trait]
impl BrokerGateway for ClientPortalGateway {
    async fn connect(&self, endpoint: &GatewayEndpoint) -> GatewayResult<()> {
        *self.base_url.write().await = format!("https://{}:{}", endpoint.host, endpoint.port);
        *self.client_id.write().await = endpoint.client_id;

        let status: AuthStatus = self.post("/iserver/auth/status", &serde_json::json!({})).await?;
        debug!(
            authenticated = status.authenticated,
            connected = status.connected,
            competing = status.competing,
            "Gateway auth status"
        );

        if !(status.authenticated && status.connected) {
            self.connected.store(false, Ordering::SeqCst);
            return Err(GatewayError::Connectivity(
                "gateway session is not authenticated".to_string(),
            ));
        }

        self.account().await?;
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) -> GatewayResult<()> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        // The gateway keeps its brokerage login; we only end this API session.
        let _: Value = self.post("/logout", &serde_json::json!({})).await?;
        Ok(())
    }

    async fn qualify_contracts(&self, instruments: &[Instrument]) -> GatewayResult<Vec<Instrument>> {
        let mut qualified = Vec::with_capacity(instruments.len());
        for instrument in instruments {
            match self.qualify_one(instrument).await? {
                Some(q) => qualified.push(q),
                None => warn!(instrument = %instrument, "Contract could not be qualified"),
            }
        }
        Ok(qualified)
    }

    async fn historical_bars(&self, instrument: &Instrument, request: &BarRequest) -> GatewayResult<Vec<Bar>> {
        let con_id = instrument
            .con_id
            .ok_or_else(|| GatewayError::Decode(format!("{} is not qualified", instrument)))?;

        let path = format!(
            "/hmds/history?conid={}&period={}&bar={}&outsideRth={}&source={}",
            con_id,
            history_period(&request.duration),
            history_bar(&request.bar_size),
            !request.regular_hours_only,
            history_source(&request.price_type),
        );

        let history: HistoryResponse = self.get(&path).await?;
        Ok(history.data.into_iter().filter_map(HistoryBar::into_bar).collect())
    }

    async fn positions(&self) -> GatewayResult<Vec<Position>> {
        let account = self.account().await?;
        let entries: Vec<PositionEntry> = self
            .get(&format!("/portfolio/{}/positions/0", account))
            .await?;

        Ok(entries
            .into_iter()
            .map(|p| {
                let mut position = Position::new(
                    p.instrument(),
                    Decimal::try_from(p.position).unwrap_or(Decimal::ZERO),
                    Decimal::try_from(p.avg_cost).unwrap_or(Decimal::ZERO),
                )
                .with_unrealized_pnl(Decimal::try_from(p.unrealized_pnl).unwrap_or(Decimal::ZERO));
                position.market_price = p.mkt_price.and_then(|m| Decimal::try_from(m).ok());
                position
            })
            .collect())
    }

    async fn open_orders(&self) -> GatewayResult<Vec<LiveOrder>> {
        Ok(self
            .order_snapshot()
            .await?
            .into_iter()
            .filter(|o| o.is_active())
            .collect())
    }

    async fn trades(&self) -> GatewayResult<Vec<LiveOrder>> {
        self.order_snapshot().await
    }

    async fn account_values(&self) -> GatewayResult<Vec<AccountValue>> {
        let account = self.account().await?;
        let ledger: serde_json::Map<String, Value> = self
            .get(&format!("/portfolio/{}/ledger", account))
            .await?;

        let mut values = Vec::new();
        for (key, entry) in ledger {
            let Some(fields) = entry.as_object() else { continue };
            let currency = match key.as_str() {
                "BASE" => fields
                    .get("currency")
                    .and_then(Value::as_str)
                    .unwrap_or("BASE")
                    .to_string(),
                other => other.to_string(),
            };

            for (tag, value) in fields {
                if let Some(n) = value.as_f64() {
                    values.push(AccountValue {
                        account: account.clone(),
                        tag: tag.clone(),
                        value: format!("{:.2}", n),
                        currency: currency.clone(),
                    });
                }
            }
        }
        Ok(values)
    }

    async fn submit_order(&self, instrument: &Instrument, intent: &OrderIntent) -> GatewayResult<LiveOrder> {
        let account = self.account().await?;
        let tickets = self.tickets_for(instrument, intent).await?;
        let path = format!("/iserver/account/{}/orders", account);

        let mut replies: Vec<PlaceOrderReply> = self.post(&path, &PlaceOrdersRequest { orders: tickets }).await?;

        for _ in 0..MAX_REPLY_ROUNDS {
            let confirm = replies.iter().find_map(|r| match r {
                PlaceOrderReply::Confirm { id, message } => Some((id.clone(), message.join("; "))),
                PlaceOrderReply::Placed { .. } => None,
            });
            let Some((reply_id, message)) = confirm else { break };

            info!(reply_id = %reply_id, message = %message, "Confirming order warning");
            replies = self
                .post(&format!("/iserver/reply/{}", reply_id), &ReplyConfirmation { confirmed: true })
                .await?;
        }

        let (order_id, status) = replies
            .iter()
            .find_map(|r| match r {
                PlaceOrderReply::Placed { order_id, order_status } => Some((*order_id, order_status.clone())),
                PlaceOrderReply::Confirm { .. } => None,
            })
            .ok_or_else(|| GatewayError::Decode("order was not acknowledged".to_string()))?;

        let (order_type, limit_price) = match &intent.kind {
            OrderKind::Market => ("MKT".to_string(), None),
            OrderKind::Bracket { limit_price, .. } => ("LMT".to_string(), Some(*limit_price)),
        };

        Ok(LiveOrder {
            order_id: order_id.to_string(),
            status: OrderStatus::parse(&status),
            instrument: instrument.clone(),
            side: intent.side,
            quantity: intent.quantity,
            order_type,
            limit_price,
        })
    }

    async fn cancel_order(&self, order: &LiveOrder) -> GatewayResult<()> {
        let account = self.account().await?;
        let path = format!("/iserver/account/{}/order/{}", account, order.order_id);
        let _: Value = self.request::<(), Value>(Method::DELETE, &path, None).await?;
        Ok(())
    }

    async fn scan_market(&self, subscription: &ScannerSubscription) -> GatewayResult<Vec<Instrument>> {
        let request = ScannerRunRequest {
            instrument: subscription.instrument.clone(),
            location: subscription.location_code.clone(),
            scan_type: subscription.scan_code.clone(),
            filter: subscription
                .filters
                .iter()
                .map(|(code, value)| ScannerFilter {
                    code: code.clone(),
                    value: value.clone(),
                })
                .collect(),
        };

        let response: ScannerRunResponse = self.post("/iserver/scanner/run", &request).await?;
        info!(count = response.contracts.len(), "Scanner returned contracts");
        Ok(response.contracts.iter().map(ScannerContract::instrument).collect())
    }
}
