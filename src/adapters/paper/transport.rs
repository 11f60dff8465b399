//! Paper transport with simulated immediate fills.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use rust_decimal::{Decimal, RoundingStrategy};
use tokio::sync::RwLock;
use tracing::info;

use crate::domain::trade::{Direction, IdempotencyToken};
use crate::ports::execution::{
    ExecutionRequest, ExecutionResult, ExecutionStatus, ExecutionTransport, RequestKind,
    TransportError,
};

/// Results remembered by default before the oldest are evicted.
pub const DEFAULT_RESULT_CAPACITY: usize = 10_000;

#[derive(Default)]
struct ResultBook {
    results: HashMap<IdempotencyToken, ExecutionResult>,
    /// Insertion order, oldest first.
    order: VecDeque<IdempotencyToken>,
    seen: usize,
}

/// Paper execution transport.
///
/// Fills opens for `stake / price` units and closes for the requested
/// quantity. Results are kept per token so a repeated submission or a
/// status query returns the original fill; only the most recent
/// `capacity` results are remembered.
pub struct PaperTransport {
    slippage: Decimal,
    capacity: usize,
    book: RwLock<ResultBook>,
}

impl PaperTransport {
    pub fn new(slippage_bps: u32) -> Self {
        Self::with_capacity(slippage_bps, DEFAULT_RESULT_CAPACITY)
    }

    pub fn with_capacity(slippage_bps: u32, capacity: usize) -> Self {
        Self {
            slippage: Decimal::from(slippage_bps) / Decimal::from(10_000),
            capacity: capacity.max(1),
            book: RwLock::new(ResultBook::default()),
        }
    }

    /// Number of requests seen.
    pub async fn submissions(&self) -> usize {
        self.book.read().await.seen
    }

    /// Number of results currently remembered.
    pub async fn remembered(&self) -> usize {
        self.book.read().await.results.len()
    }

    /// Limit price moved against us by the slippage.
    fn fill_price(&self, request: &ExecutionRequest) -> Decimal {
        let buying = match (&request.kind, request.direction()) {
            (RequestKind::Open { .. }, Direction::Long)
            | (RequestKind::Close { .. }, Direction::Short) => true,
            (RequestKind::Open { .. }, Direction::Short)
            | (RequestKind::Close { .. }, Direction::Long) => false,
        };
        let factor = if buying {
            Decimal::ONE + self.slippage
        } else {
            Decimal::ONE - self.slippage
        };
        request.limit_price() * factor
    }

    fn simulate(&self, request: &ExecutionRequest) -> ExecutionResult {
        let price = self.fill_price(request);
        if price <= Decimal::ZERO {
            return ExecutionResult::unfilled(
                request.token,
                ExecutionStatus::Rejected,
                "non-positive fill price",
            );
        }
        let quantity = match &request.kind {
            RequestKind::Open { order } => (order.capped_stake / price)
                .round_dp_with_strategy(6, RoundingStrategy::ToZero),
            RequestKind::Close { quantity, .. } => *quantity,
        };
        if quantity <= Decimal::ZERO {
            return ExecutionResult::unfilled(
                request.token,
                ExecutionStatus::Rejected,
                "stake too small to fill",
            );
        }
        ExecutionResult::filled(request.token, price, quantity)
    }
}

#[async_trait]
impl ExecutionTransport for PaperTransport {
    async fn submit_execution(
        &self,
        request: &ExecutionRequest,
    ) -> Result<ExecutionResult, TransportError> {
        let mut book = self.book.write().await;
        if let Some(existing) = book.results.get(&request.token) {
            return Ok(existing.clone());
        }
        let result = self.simulate(request);
        info!(
            token = %request.token,
            market = %request.market,
            status = result.status.label(),
            price = ?result.fill_price,
            quantity = %result.fill_quantity,
            "Paper execution"
        );
        book.seen += 1;
        book.results.insert(request.token, result.clone());
        book.order.push_back(request.token);
        while book.order.len() > self.capacity {
            if let Some(oldest) = book.order.pop_front() {
                book.results.remove(&oldest);
            }
        }
        Ok(result)
    }

    async fn query_status(
        &self,
        token: &IdempotencyToken,
    ) -> Result<ExecutionResult, TransportError> {
        self.book
            .read()
            .await
            .results
            .get(token)
            .cloned()
            .ok_or(TransportError::UnknownToken(*token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_close_fills_with_slippage_against_seller() {
        let transport = PaperTransport::new(100);
        let request =
            ExecutionRequest::close("m".to_string(), Direction::Long, dec!(10), dec!(0.50));
        let result = transport.submit_execution(&request).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Filled);
        assert_eq!(result.fill_price, Some(dec!(0.495)));
        assert_eq!(result.fill_quantity, dec!(10));
    }

    #[tokio::test]
    async fn test_resubmission_returns_original_result() {
        let transport = PaperTransport::new(0);
        let request =
            ExecutionRequest::close("m".to_string(), Direction::Long, dec!(10), dec!(0.50));
        let first = transport.submit_execution(&request).await.unwrap();
        let second = transport.submit_execution(&request).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(transport.submissions().await, 1);
        assert_eq!(transport.query_status(&request.token).await.unwrap(), first);
    }

    #[tokio::test]
    async fn test_oldest_results_evicted_past_capacity() {
        let transport = PaperTransport::with_capacity(0, 2);
        let requests: Vec<_> = (0..3)
            .map(|_| ExecutionRequest::close("m".to_string(), Direction::Long, dec!(1), dec!(0.5)))
            .collect();
        for request in &requests {
            transport.submit_execution(request).await.unwrap();
        }
        assert_eq!(transport.submissions().await, 3);
        assert_eq!(transport.remembered().await, 2);
        assert_eq!(
            transport.query_status(&requests[0].token).await,
            Err(TransportError::UnknownToken(requests[0].token))
        );
        assert!(transport.query_status(&requests[2].token).await.is_ok());
    }

    #[tokio::test]
    async fn test_query_unknown_token() {
        let transport = PaperTransport::new(0);
        let token = IdempotencyToken::new();
        assert_eq!(
            transport.query_status(&token).await,
            Err(TransportError::UnknownToken(token))
        );
    }
}
