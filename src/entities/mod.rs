pub mod delivery_address;
pub mod order;
pub mod order_cancellation_request;
pub mod order_item;
pub mod order_refund;
pub mod order_status_history;
pub mod payment_mode_charge;
pub mod product;
