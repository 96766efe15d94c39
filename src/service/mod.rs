pub mod device;
pub mod hass;
pub mod hass_gc;
pub mod mqtt;
pub mod state;
