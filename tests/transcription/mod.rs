mod config;
mod layout;
