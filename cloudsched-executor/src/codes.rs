//! Status code taxonomy of a test attempt
//!
//! The executor compresses every attempt into one integer:
//!
//! - 0       test executed and passed
//! - 11..=16 test errors and failures (raw test exit + 10)
//! - 21..=24 availability zone failures
//! - 31..=33 container pool failures
//! - 41      provisioning failure

/// Raw test exit codes are offset by this much at the executor boundary.
pub const TEST_CODE_OFFSET: i32 = 10;

/// Symbolic name of an executor status code.
///
/// Codes outside the taxonomy render as `unknown_status`.
pub fn symbol(code: i32) -> &'static str {
    match code {
        0 => "test_passed",
        11 => "test_general_error",
        12 => "test_container_error",
        13 => "test_log_delivery_error",
        14 => "test_failed_general",
        15 => "test_failed_error_cases",
        16 => "test_failed_failure_cases",
        21 => "flavor_general_error",
        22 => "flavor_no_stock",
        23 => "flavor_azone_disabled",
        24 => "flavor_azone_occupied",
        31 => "container_error",
        32 => "container_all_busy",
        33 => "container_lock_error",
        41 => "provision_error",
        _ => "unknown_status",
    }
}

/// Every code the dry-run scheduler may fabricate.
pub const ALL_CODES: [i32; 15] = [0, 11, 12, 13, 14, 15, 16, 21, 22, 23, 24, 31, 32, 33, 41];
