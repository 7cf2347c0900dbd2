mod common;
mod ingestion_tests;
