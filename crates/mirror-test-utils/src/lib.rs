// Copyright (c) The Mirror Developers
// SPDX-License-Identifier: Apache-2.0

//! Test utilities shared between the mirror harness crates.

/// A result type useful in tests, that wraps any error implementation.
pub type Result<T = ()> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Initializes a plain `tracing` subscriber for tests, ignoring re-initialization.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt::try_init();
}

/// Macro for creating parametrized tests.
///
/// The `param_test!` macro accepts the name of an existing function, followed by a list of case
/// names and their arguments. It expands to a module with a `#[test]` function for each of the
/// cases. Each test case calls the existing, named function with their provided arguments.
///
/// # Examples
///
/// Calling a simple test function can be done as follows:
///
/// ```
/// # use mirror_test_utils::param_test;
/// #
/// param_test! {
///     test_sum: [
///         positive_sums: (10, 7, 17),
///         negative_sums: (-5, -3, -8)
///     ]
/// }
/// fn test_sum(lhs: i32, rhs: i32, sum: i32) {
///     assert_eq!(lhs + rhs, sum);
/// }
/// ```
///
/// Test functions can also have return types, such as a [`Result`]:
///
/// ```
/// # use std::error::Error;
/// # use mirror_test_utils::param_test;
/// #
/// param_test! {
///     test_parses -> Result<(), Box<dyn Error>>: [
///         positive: ("21", 21),
///         negative: ("-17", -17),
///     ]
/// }
/// fn test_parses(to_parse: &str, expected: i32) -> Result<(), Box<dyn Error>> {
///     assert_eq!(expected, to_parse.parse::<i32>()?);
///     Ok(())
/// }
/// ```
///
/// Finally, attributes such as `#[ignore]` may be added to individual tests:
///
/// ```
/// # use std::error::Error;
/// # use mirror_test_utils::param_test;
/// #
/// param_test! {
///     test_parses -> Result<(), Box<dyn Error>>: [
///         #[ignore] positive: ("21", 21),
///         negative: ("-17", -17),
///     ]
/// }
/// fn test_parses(to_parse: &str, expected: i32) -> Result<(), Box<dyn Error>> {
///     assert_eq!(expected, to_parse.parse::<i32>()?);
///     Ok(())
/// }
/// ```
#[macro_export]
macro_rules! param_test {
    ($func_name:ident -> $return_ty:ty: [
        $( $(#[$outer:meta])* $case_name:ident:
            $(<$($type_args:ty),+>)?( $($args:expr),* $(,)? ) ),+$(,)?
    ]) => {
        mod $func_name {
            use super::*;

            $(
                #[test]
                $(#[$outer])*
                fn $case_name() -> $return_ty {
                    $func_name$(::<$($type_args),+>)?($($args),*)
                }
            )*
        }
    };
    ($func_name:ident: [
        $( $(#[$outer:meta])* $case_name:ident:
            $(<$($type_args:ty),+>)?( $($args:expr),* $(,)? ) ),+$(,)?
    ]) => {
        $crate::param_test!(
            $func_name -> ():
            [ $( $(#[$outer])* $case_name: $(<$($type_args),+>)?( $($args),* ) ),+ ]
        );
    };
}

/// Asserts that two sequences that implement [`std::iter::IntoIterator`], and whose items
/// implement [`Ord`], are equal, irrespective of ordering.
#[macro_export]
macro_rules! assert_unordered_eq {
    ($lhs:expr, $rhs:expr) => {
        let mut lhs: Vec<_> = $lhs.into_iter().collect();
        let mut rhs: Vec<_> = $rhs.into_iter().collect();

        lhs.sort();
        rhs.sort();

        assert_eq!(lhs, rhs);
    };
}

#[cfg(test)]
mod tests {
    use crate::Result;

    param_test! {
        test_with_no_return: [
            case1: (true, 1, 1),
            case2: (false, 3, 4)
        ]
    }
    fn test_with_no_return(bool_arg: bool, usize_arg: usize, u32_arg: u32) {
        assert_eq!(bool_arg, Ok(usize_arg) == usize::try_from(u32_arg));
    }

    param_test! {
        test_with_return -> super::Result: [
            case1: ("5", 5),
            case2: ("7", 7)
        ]
    }
    fn test_with_return(to_parse: &str, parsed: usize) -> super::Result {
        let result: usize = to_parse.parse()?;
        assert_eq!(parsed, result);
        Ok(())
    }

    #[test]
    fn unordered_eq() {
        assert_unordered_eq!(vec![3, 1, 2], vec![1, 2, 3]);
    }
}
