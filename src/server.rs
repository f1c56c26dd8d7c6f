//! things used to make the jam server
//!
//! The server never touches audio.  It authenticates users, keeps the roster,
//! relays compressed intervals from each uploader to the users subscribed to
//! that channel, and optionally archives everything to disk.
pub mod acl;
pub mod broadcast_server;
pub mod server_config;
pub mod session_archive;
pub mod user_connection;
pub mod user_group;
pub mod user_lookup;
pub mod vote;
