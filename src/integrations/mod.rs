//! Contracts for the external payment gateway and shipping carrier, plus
//! their HTTP implementations.

pub mod payment_gateway;
pub mod razorpay;
pub mod shipping_carrier;
pub mod shiprocket;
pub mod signature;

pub use payment_gateway::{GatewayOrder, GatewayPayment, GatewayRefund, Notes, PaymentGateway};
pub use razorpay::RazorpayClient;
pub use shipping_carrier::{
    CancellationEligibility, CarrierCancellation, CourierAssignment, CourierOption,
    CreatedShipment, ShipmentAddress, ShipmentItem, ShipmentRequest, ShippingCarrier,
    TrackingEvent, TrackingInfo,
};
pub use shiprocket::ShiprocketClient;
