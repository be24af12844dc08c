//! Autos Crawler - turbo.az listing crawler
//!
//! Walks a range of listing index pages, scrapes every listing's detail page
//! (including the phone reveal call), and stores the results in SQLite with
//! checkpointed progress so an interrupted run can pick up where it stopped.

// Module declarations
pub mod application;
pub mod domain;
pub mod infrastructure;
