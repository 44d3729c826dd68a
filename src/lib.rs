#![warn(clippy::all)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::must_use_candidate
)]

//! Paula: a conversational health coach. Chat messages from Messenger and
//! Alterdesk go through the API.ai agent; its actions drive questionnaires,
//! device connections, recipes and escalations to a human coach.

pub mod channels;
pub mod config;
pub mod conversation;
pub mod gateway;
pub mod integrations;
pub mod nlu;
pub mod session;
pub mod store;
pub mod util;

pub use config::Config;
