//! Simulated order gateway for paper trading.
//!
//! Market orders fill immediately at the ticket price moved against us by a
//! configurable slippage. Resting stop-loss orders wait until [`PaperGateway::mark`]
//! sees a price through their trigger.

use std::collections::HashMap;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::info;

use super::OrderGateway;
use crate::error::GatewayError;
use crate::models::{OrderIntent, OrderState, OrderUpdate, Side};

#[derive(Debug, Clone)]
struct PaperOrder {
    intent: OrderIntent,
    state: OrderState,
}

#[derive(Debug, Default)]
struct Book {
    orders: HashMap<String, PaperOrder>,
    next_id: u64,
}

/// Order gateway that never leaves the process.
pub struct PaperGateway {
    /// Fraction of price lost on every market fill, e.g. 0.0005 for 5 bps.
    slippage: Decimal,
    book: Mutex<Book>,
}

impl PaperGateway {
    pub fn new(slippage: Decimal) -> Self {
        Self {
            slippage,
            book: Mutex::new(Book::default()),
        }
    }

    /// Fill price for a market order at `reference`, after slippage.
    fn fill_price(&self, intent: &OrderIntent, reference: Decimal) -> Decimal {
        let adverse = reference * self.slippage;
        if intent.transaction_type() == "BUY" {
            reference + adverse
        } else {
            reference - adverse
        }
    }

    /// Feed a traded price; triggers any resting stop it crosses.
    ///
    /// Returns the IDs of orders filled by this mark.
    pub async fn mark(&self, symbol: &str, price: Decimal) -> Vec<String> {
        let mut book = self.book.lock().await;
        let mut filled = Vec::new();

        for (id, order) in book.orders.iter_mut() {
            if order.state.is_terminal() || !order.intent.is_resting_stop() {
                continue;
            }
            let ticket = order.intent.ticket();
            if ticket.symbol != symbol {
                continue;
            }

            let triggered = match ticket.side {
                Side::Long => price <= ticket.price,
                Side::Short => price >= ticket.price,
            };
            if triggered {
                order.state = OrderState::Filled {
                    average_price: self.fill_price(&order.intent, price),
                    filled_quantity: ticket.quantity,
                };
                info!(order_id = %id, symbol, %price, "Paper stop-loss triggered");
                filled.push(id.clone());
            }
        }

        filled
    }

    /// Number of orders still resting.
    pub async fn open_orders(&self) -> usize {
        self.book
            .lock()
            .await
            .orders
            .values()
            .filter(|o| !o.state.is_terminal())
            .count()
    }
}

#[async_trait]
impl OrderGateway for PaperGateway {
    async fn submit(&self, intent: &OrderIntent) -> Result<String, GatewayError> {
        let ticket = intent.ticket();
        if ticket.quantity == 0 {
            return Err(GatewayError::Rejected("quantity must be positive".to_string()));
        }

        let mut book = self.book.lock().await;
        book.next_id += 1;
        let order_id = format!("PAPER-{}", book.next_id);

        let state = match intent {
            OrderIntent::StopLoss {
                at_market: false, ..
            } => OrderState::Pending,
            OrderIntent::Entry { limit: true, .. } => OrderState::Filled {
                average_price: ticket.price,
                filled_quantity: ticket.quantity,
            },
            _ => OrderState::Filled {
                average_price: self.fill_price(intent, ticket.price),
                filled_quantity: ticket.quantity,
            },
        };

        info!(
            order_id = %order_id,
            kind = intent.kind(),
            symbol = %ticket.symbol,
            transaction = intent.transaction_type(),
            quantity = ticket.quantity,
            state = state.as_str(),
            "Paper order"
        );

        book.orders.insert(
            order_id.clone(),
            PaperOrder {
                intent: intent.clone(),
                state,
            },
        );
        Ok(order_id)
    }

    async fn order_status(&self, order_id: &str) -> Result<OrderUpdate, GatewayError> {
        let book = self.book.lock().await;
        let order = book
            .orders
            .get(order_id)
            .ok_or_else(|| GatewayError::UnknownOrder(order_id.to_string()))?;

        Ok(OrderUpdate {
            order_id: order_id.to_string(),
            state: order.state.clone(),
        })
    }

    async fn cancel(&self, order_id: &str) -> Result<(), GatewayError> {
        let mut book = self.book.lock().await;
        let order = book
            .orders
            .get_mut(order_id)
            .ok_or_else(|| GatewayError::UnknownOrder(order_id.to_string()))?;

        if order.state.is_terminal() {
            return Err(GatewayError::Rejected(format!(
                "order {} is already {}",
                order_id,
                order.state.as_str()
            )));
        }

        order.state = OrderState::cancelled();
        Ok(())
    }
}
