//! Terminal client for the LAN chat server: connects, announces a
//! username, prints history and live broadcasts, and sends stdin lines as
//! messages.

pub mod network;
