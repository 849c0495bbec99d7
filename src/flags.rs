//! Request-scoped feature flags.
//!
//! Flag ids are persisted inside cached sessions, so the numeric values below
//! must never be reordered.

use std::fmt;

use crate::error::{Code, Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Flag {
    SearchUsingLegacyAddressTable = 1,
    SearchUsingAddressesTable = 2,
    SearchUsingOpensearch = 3,
    ApiAddressLayoutEnabled = 4,
    ApiAssessorLayoutEnabled = 5,
    ApiCompsLayoutEnabled = 6,
    ApiListingLayoutEnabled = 7,
    ApiRecorderLayoutEnabled = 8,
    ApiRentEstimateLayoutEnabled = 9,
    ApiSaleEstimateLayoutEnabled = 10,
}

const ALL: [Flag; 10] = [
    Flag::SearchUsingLegacyAddressTable,
    Flag::SearchUsingAddressesTable,
    Flag::SearchUsingOpensearch,
    Flag::ApiAddressLayoutEnabled,
    Flag::ApiAssessorLayoutEnabled,
    Flag::ApiCompsLayoutEnabled,
    Flag::ApiListingLayoutEnabled,
    Flag::ApiRecorderLayoutEnabled,
    Flag::ApiRentEstimateLayoutEnabled,
    Flag::ApiSaleEstimateLayoutEnabled,
];

impl Flag {
    #[must_use]
    pub fn id(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub fn from_id(id: u8) -> Option<Flag> {
        ALL.iter().copied().find(|f| f.id() == id)
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Flag::SearchUsingLegacyAddressTable => "SEARCH_USING_LEGACY_ADDRESS_TABLE",
            Flag::SearchUsingAddressesTable => "SEARCH_USING_ADDRESSES_TABLE",
            Flag::SearchUsingOpensearch => "SEARCH_USING_OPENSEARCH",
            Flag::ApiAddressLayoutEnabled => "API_ADDRESS_LAYOUT_ENABLED",
            Flag::ApiAssessorLayoutEnabled => "API_ASSESSOR_LAYOUT_ENABLED",
            Flag::ApiCompsLayoutEnabled => "API_COMPS_LAYOUT_ENABLED",
            Flag::ApiListingLayoutEnabled => "API_LISTING_LAYOUT_ENABLED",
            Flag::ApiRecorderLayoutEnabled => "API_RECORDER_LAYOUT_ENABLED",
            Flag::ApiRentEstimateLayoutEnabled => "API_RENT_ESTIMATE_LAYOUT_ENABLED",
            Flag::ApiSaleEstimateLayoutEnabled => "API_SALE_ESTIMATE_LAYOUT_ENABLED",
        }
    }

    /// Looks a flag up by its wire name.
    #[must_use]
    pub fn select(name: &str) -> Option<Flag> {
        ALL.iter().copied().find(|f| f.name() == name)
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Checks that every name is a known flag.
pub fn validate_many(names: &[&str]) -> Result<()> {
    for name in names {
        if name.is_empty() {
            return Err(Error::new("f86d1e72-cf1a-44c2-b51a-6a928c83617d", Code::InvalidArgument, "Empty flag."));
        }
        if Flag::select(name).is_none() {
            return Err(
                Error::new("1d813e86-a410-4202-8ab8-47814e380e21", Code::InvalidArgument, "Unknown flag.")
                    .with_meta("flag", *name),
            );
        }
    }
    Ok(())
}

/// A small immutable set of flags backed by a bitmask.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags(u32);

impl Flags {
    #[must_use]
    pub fn empty() -> Self {
        Flags(0)
    }

    #[must_use]
    pub fn with(self, flag: Flag) -> Self {
        Flags(self.0 | (1 << flag.id()))
    }

    #[must_use]
    pub fn contains(&self, flag: Flag) -> bool {
        self.0 & (1 << flag.id()) != 0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Flag> + '_ {
        ALL.iter().copied().filter(|f| self.contains(*f))
    }

    #[must_use]
    pub fn ids(&self) -> Vec<u8> {
        self.iter().map(Flag::id).collect()
    }

    /// Builds a set from persisted ids, skipping ids this build does not know.
    #[must_use]
    pub fn from_ids(ids: &[u8]) -> Self {
        ids.iter()
            .filter_map(|id| Flag::from_id(*id))
            .fold(Flags::empty(), Flags::with)
    }

    pub fn from_names(names: &[&str]) -> Result<Self> {
        validate_many(names)?;
        Ok(names
            .iter()
            .filter_map(|n| Flag::select(n))
            .fold(Flags::empty(), Flags::with))
    }

    /// Fails with `permission_denied` when the flag is not set.
    pub fn require(&self, flag: Flag) -> Result<()> {
        if self.contains(flag) {
            return Ok(());
        }
        Err(
            Error::new("8d69e702-0b10-455c-b1a1-3388009662a3", Code::PermissionDenied, "Layout not enabled.")
                .with_meta("flag", flag.name()),
        )
    }
}

impl FromIterator<Flag> for Flags {
    fn from_iter<I: IntoIterator<Item = Flag>>(iter: I) -> Self {
        iter.into_iter().fold(Flags::empty(), Flags::with)
    }
}
