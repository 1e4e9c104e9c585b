pub mod cart_service;
pub mod checkout_service;
pub mod pricing;

pub use cart_service::{CartLine, CartService, CartSnapshot};
pub use checkout_service::{CheckoutRequest, CheckoutService, PlacedOrder};
pub use pricing::{OrderTotals, ShippingPolicy};
