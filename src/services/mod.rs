pub mod admin_service;
pub mod cart_service;
pub mod checkout_service;
pub mod order_service;
pub mod payment_service;
pub mod pricing;
pub mod stock;
pub mod webhook_service;
