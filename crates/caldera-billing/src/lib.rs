mod engine;
mod users;

pub use engine::{BillingEngine, BillingSummary, CreditPurchase, PricingInfo, StorageCharge};
pub use users::{UserProfile, UserService};
