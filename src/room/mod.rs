//! Room Module - Raum-Beitritt und Session-Lebenszyklus
//!
//! Dieses Modul verwaltet:
//! - Beitreten und Verlassen eines Raums
//! - Den Session-Task, der alle Eingaben nacheinander verarbeitet
//! - Mute-Einstellungen über Sessions hinweg

mod actor;
mod coordinator;

pub use coordinator::{RoomCoordinator, RoomError};
