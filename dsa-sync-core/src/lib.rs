#![doc = "dsa-sync-core: core logic library for dsa-sync."]

//! This crate contains the data model, the tree synchronizer, the spreadsheet
//! transformer and the chunked upload protocol. The HTTP client, configuration
//! loading and triggers live in the `dsa-sync` crate.
//!
//! # Usage
//! Call [`synchronise::synchronise`] with a [`config::SyncConfig`], a
//! [`contract::RemoteStore`], a [`contract::SheetTransformer`] and a
//! [`contract::ArtifactCache`].

pub mod artifacts;
pub mod chunked;
pub mod config;
pub mod contract;
pub mod ignore;
pub mod scaffold;
pub mod synchronise;
pub mod transform;
