pub mod audit;
pub mod customer;
pub mod idempotency;
pub mod order;
pub mod payment;
pub mod product;

pub use audit::*;
pub use customer::*;
pub use idempotency::*;
pub use order::*;
pub use payment::*;
pub use product::*;
