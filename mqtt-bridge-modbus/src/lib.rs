//! MQTT bridge for a single Modbus field device.
//!
//! Commands arriving on the command topic are written to a holding register
//! and answered on the response topic. Independently, a status register is
//! read on a fixed period and published, scaled, on the status topic.
//!
//! # Topics
//!
//! ```text
//! maison/commande  (subscribe)  "<integer>"
//! maison/reponse   (publish)    "Commande <N> envoyée" | "Erreur lors de l'envoi" | "Commande invalide"
//! maison/statut    (publish)    "Température: <value>°C"
//! ```

pub mod bus;
pub mod config;
pub mod error;
pub mod fieldbus;
pub mod mock;
pub mod poller;
pub mod supervisor;
pub mod translator;

pub use error::{BridgeError, Result};
