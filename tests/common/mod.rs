#![allow(dead_code)]

pub(crate) mod dummy_processor;

pub(crate) mod fixtures;

pub(crate) mod kv_operation;

pub(crate) mod logging;

pub(crate) mod mem_db;
