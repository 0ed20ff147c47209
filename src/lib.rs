#![forbid(unsafe_code)]

//! Library half of the vidfetch backend.
//!
//! The HTTP layer (`api`) only talks to the job registry and the worker; the
//! worker only talks to a [`fetcher::MediaFetcher`]. `ytdlp` is the production
//! fetcher, tests plug in their own.

pub mod api;
pub mod config;
pub mod fetcher;
pub mod jobs;
pub mod naming;
pub mod quality;
pub mod security;
pub mod worker;
pub mod ytdlp;
