//! 外部检索工具

pub mod arxiv;

pub use arxiv::{ArxivClient, Paper, ARXIV_API_URL, MAX_ARXIV_RESULTS};
