//! Drive-letter arbitration for virtual disk mounts.

use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::BTreeSet;

use crate::error::{PackError, Result};

/// Every identifier a volume can be mounted on.
pub fn alphabet() -> impl Iterator<Item = char> {
    'A'..='Z'
}

/// Parse `wmic LOGICALDISK LIST BRIEF /format:csv` output.
///
/// The second column holds the device id (`C:`); the header row and blank
/// lines are skipped.
pub fn parse_wmic_csv(output: &str) -> BTreeSet<char> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| line.split(',').nth(1))
        .map(str::trim)
        .filter(|field| !field.eq_ignore_ascii_case("deviceid"))
        .filter_map(|field| field.chars().next())
        .filter(char::is_ascii_alphabetic)
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Letters not present in `occupied`, in alphabetical order.
pub fn free_letters(occupied: &BTreeSet<char>) -> Vec<char> {
    alphabet().filter(|c| !occupied.contains(c)).collect()
}

/// Pick the mount letter.
///
/// An explicit letter always wins. Otherwise one free letter is chosen
/// uniformly at random so repeated runs do not keep colliding on the same one.
pub fn allocate_letter<R: Rng + ?Sized>(
    explicit: Option<char>,
    occupied: &BTreeSet<char>,
    rng: &mut R,
) -> Result<char> {
    if let Some(letter) = explicit {
        return Ok(letter.to_ascii_uppercase());
    }

    free_letters(occupied)
        .choose(rng)
        .copied()
        .ok_or_else(|| PackError::unsupported("no free drive letter left to mount the virtual disk on"))
}
