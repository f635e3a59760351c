//! nfd-master: reconcile discovered node features into Kubernetes node
//! labels, annotations, extended resources and taints.

pub mod apis;
pub mod cli;
pub mod client;
pub mod config;
pub mod controller;
pub mod gc;
pub mod leader;
pub mod master;
pub mod metrics;
pub mod rules;
pub mod server;
pub mod service;
pub mod store;
pub mod workqueue;
