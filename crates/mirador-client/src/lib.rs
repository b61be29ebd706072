//! Mirador Client - HTTP client for the upstream listings API.
//!
//! [`ListingsClient`] implements [`mirador_core::traits::UpstreamClient`]:
//! authentication headers, status classification, response parsing, and
//! retries through the shared [`mirador_core::RetryPolicy`].

pub mod listings;

pub use listings::{classify_status, parse_list_page, ListingsClient, ListingsClientFactory};
