//! doorman: a reaction-gated approval workflow for a community chat space.
//!
//! Members ask for access or a directory account; the bot posts a request
//! card to a review channel; moderators decide by reacting to the card; the
//! bot applies the decision (role changes or directory provisioning) and
//! retires the card.

pub mod card;
pub mod chat;
pub mod command;
pub mod config;
pub mod directory;
pub mod expiry;
pub mod ingress;
pub mod reconcile;
pub mod roles;
pub mod tracker;
pub mod webhook;
