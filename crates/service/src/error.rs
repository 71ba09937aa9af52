//! Handle errors

use itertools::Itertools;

/// Render an error and its sources as a single `: ` separated line
pub fn chain<E: std::error::Error>(err: E) -> String {
    std::iter::successors(Some(&err as &dyn std::error::Error), |e| e.source())
        .map(ToString::to_string)
        .join(": ")
}
