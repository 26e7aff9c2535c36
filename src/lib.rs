#![allow(unused_assignments)] // thiserror/miette proc macros trigger false positives

pub mod backend;
pub mod cli;
pub mod config;
pub mod domain_xml;
pub mod dump;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod network;
pub mod paths;
pub mod poll;
pub mod provisioner;
pub mod ssh;
pub mod vm_state;
pub mod volume;
pub mod volume_xml;
pub mod xml;
