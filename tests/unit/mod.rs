//! Unit test modules.

mod counter_test;
mod csc_decoder_test;
