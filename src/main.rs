// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

pub use hopchain::*;


// These tests live outside the library so that they only see its public
// API, and so whole clusters (executors, transports, dispatchers) get wired
// together the way an embedding program would do it.

#[test]
fn typing_test() {
    test::typing_test();
}

#[test]
fn leaderboard_test() {
    test::leaderboard_test();
}

#[test]
fn payment_test() {
    test::payment_test();
}

#[test]
fn concurrent_add_points_test() {
    test::concurrent_add_points_test();
}

#[test]
fn lost_ack_test() {
    test::lost_ack_test();
}

#[test]
fn lost_requests_test() {
    test::lost_requests_test();
}

#[test]
fn retry_exhaustion_test() {
    test::retry_exhaustion_test();
}

#[test]
fn data_error_test() {
    test::data_error_test();
}

#[test]
fn storage_fault_test() {
    test::storage_fault_test();
}

#[test]
fn submit_errors_test() {
    test::submit_errors_test();
}

#[test]
fn abort_test() {
    test::abort_test();
}

#[test]
fn late_abort_test() {
    test::late_abort_test();
}

#[test]
fn hop_timeout_test() {
    test::hop_timeout_test();
}

#[test]
fn recovery_test() {
    test::recovery_test();
}

#[test]
fn file_backed_test() {
    test::file_backed_test();
}

#[test]
fn network_test() {
    test::network_test();
}

pub fn main() {
    println!("please run `cargo test` instead");
}
