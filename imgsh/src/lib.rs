//! A command shell that runs programs stored on a mounted exFAT image.
//!
//! Every executable the user names, and every `<`-redirected input file,
//! lives inside the image: the shell copies the bytes into an anonymous
//! in-memory file and replaces a forked child's image with it. The host
//! file system is only touched for the image itself and the optional
//! session log.

pub mod builtins;
pub mod command;
pub mod errors;
pub mod exec;
pub mod path;
pub mod pipeline;
pub mod shell;
