#![deny(missing_docs)]

//! Keeps serial lines open and shares them over TCP.
//!
//! Lines ("nodes") are grouped into devices.
//! Every node gets a TCP port which any number of clients may attach to,
//! seeing what the line sends and typing on it.
//! Devices additionally carry build and lock status,
//! and run automation ([`command::Command`]s) one at a time.
//!
//! The device list may be reloaded from configuration without disturbing
//! devices which did not change, see [`devices::Devices::plan_reload`].

/// The actions that can be asked of the gateway,
/// as well as the responses.
pub mod actions;

/// Hosts which may not attach to nodes.
pub mod blacklist;

/// The command line interface.
pub mod cli;

pub mod command;

/// Relates to config files.
pub mod config;

/// Who is connected to what.
pub mod connections;

/// Process-wide collaborators.
pub mod context;

pub mod device;

pub mod devices;

/// Possible errors in this library.
pub mod error;

/// Typed event broadcasting.
pub mod events;

pub mod gateway;

/// Identifier allocation.
pub mod id;

pub mod lock;

/// Logging/tracing setup.
pub mod logging;

pub mod native_port;

pub mod node;

pub mod port;

pub mod remote;

/// Connected users, resolved from hosts.
pub mod user;
