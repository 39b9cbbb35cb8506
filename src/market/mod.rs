pub mod binance;
pub mod credentials;
pub mod feed;
pub mod history;
pub mod protocol;
pub mod rest;
pub mod socket;
pub mod status;
pub mod ticker;
pub mod types;
