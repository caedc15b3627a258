pub mod bundle_component;
pub mod cart;
pub mod cart_item;
pub mod order;
pub mod order_line;
pub mod outbox_notification;
pub mod payment;
pub mod product;
pub mod stock_reservation;
pub mod webhook_event;
