//! Tests for the TCP transport


#[cfg(test)]
mod buffer_tests;



#[cfg(test)]
mod connection_tests;
