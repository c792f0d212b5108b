pub mod discount;
pub mod idempotency;
pub mod loyalty_worker;
pub mod order_service;
pub mod payment_gateway;
pub mod payment_service;
pub mod retry;

pub use discount::calculate_discount;
pub use loyalty_worker::{LoyaltyRunOutcome, LoyaltyTickSummary, LoyaltyWorker};
pub use order_service::OrderService;
pub use payment_gateway::PaymentGateway;
pub use payment_service::PaymentService;
