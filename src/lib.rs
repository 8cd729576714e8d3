//! Release orchestration for kubevirtci.
//!
//! A release runs six stages in order: trigger the `release-<provider>` Prow jobs and wait
//! for them ([dispatch]), resolve the published provider image digests ([registry]),
//! compile the cli with those digests ([build]), pack the bringup assets and the cli
//! ([tarball]), tag the repository ([git]) and publish a GitHub release ([release]).
//! [pipeline::Releaser] drives them.

pub mod auth;
pub mod build;
pub mod cli;
pub mod config;
pub mod dispatch;
pub mod git;
pub mod kube;
pub mod oci;
pub mod pipeline;
pub mod provider;
pub mod prow;
pub mod registry;
pub mod release;
pub mod tarball;
