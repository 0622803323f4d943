//! Offline-first sync core for the ironsync workout tracker.
//!
//! Everything here exists so an athlete can log a workout with no network:
//! `db` is the durable local store, `connectivity` decides whether we are
//! online, and `sync` reconciles unsynced local records with the remote
//! service. `app` wires the three together behind an explicit lifecycle.

pub mod app;
pub mod connectivity;
pub mod db;
pub mod events;
pub mod remote;
pub mod sync;
