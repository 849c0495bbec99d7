use std::fmt;

use serde::{Deserialize, Serialize};

use crate::flags::{Flag, Flags};

/// Layouts is a bitmask of the independently metered slices of a property record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Layouts(u32);

impl Layouts {
    pub const ADDRESS: Layouts = Layouts(1 << 0); // 1
    pub const ASSESSOR: Layouts = Layouts(1 << 1); // 2
    pub const COMPS: Layouts = Layouts(1 << 2); // 4
    pub const LISTING: Layouts = Layouts(1 << 3); // 8
    pub const RECORDER: Layouts = Layouts(1 << 4); // 16
    pub const RENT_ESTIMATE: Layouts = Layouts(1 << 5); // 32
    pub const SALE_ESTIMATE: Layouts = Layouts(1 << 6); // 64

    const NAMED: [(Layouts, &'static str, Flag); 7] = [
        (Self::ADDRESS, "address", Flag::ApiAddressLayoutEnabled),
        (Self::ASSESSOR, "assessor", Flag::ApiAssessorLayoutEnabled),
        (Self::COMPS, "comps", Flag::ApiCompsLayoutEnabled),
        (Self::LISTING, "listing", Flag::ApiListingLayoutEnabled),
        (Self::RECORDER, "recorder", Flag::ApiRecorderLayoutEnabled),
        (Self::RENT_ESTIMATE, "rent-estimate", Flag::ApiRentEstimateLayoutEnabled),
        (Self::SALE_ESTIMATE, "sale-estimate", Flag::ApiSaleEstimateLayoutEnabled),
    ];

    pub const fn new(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn has(self, required: Layouts) -> bool {
        self.0 & required.0 == required.0
    }

    #[must_use]
    pub const fn union(self, other: Layouts) -> Layouts {
        Layouts(self.0 | other.0)
    }

    pub fn parse(s: &str) -> Option<Layouts> {
        Self::NAMED
            .iter()
            .find(|(_, name, _)| *name == s)
            .map(|(layout, _, _)| *layout)
    }

    /// Converts a slice of layout names to a combined bitmask.
    pub fn parse_many(strs: &[&str]) -> Option<Layouts> {
        let mut result = Layouts::default();
        for s in strs {
            result = result.union(Self::parse(s)?);
        }
        Some(result)
    }

    #[must_use]
    pub fn to_strings(self) -> Vec<&'static str> {
        Self::NAMED
            .iter()
            .filter(|(layout, _, _)| self.has(*layout))
            .map(|(_, name, _)| *name)
            .collect()
    }

    /// The session flags granted by these enabled layouts.
    #[must_use]
    pub fn flags(self) -> Flags {
        Self::NAMED
            .iter()
            .filter(|(layout, _, _)| self.has(*layout))
            .map(|(_, _, flag)| *flag)
            .collect()
    }
}

impl fmt::Display for Layouts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_strings().join(", "))
    }
}

impl From<i64> for Layouts {
    fn from(bits: i64) -> Self {
        Self(bits as u32)
    }
}

impl From<Layouts> for i64 {
    fn from(l: Layouts) -> Self {
        i64::from(l.0)
    }
}

/// Per-layout debit counts of a single request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LayoutAmounts {
    pub address: i32,
    pub assessor: i32,
    pub comps: i32,
    pub listing: i32,
    pub recorder: i32,
    pub rent_estimate: i32,
    pub sale_estimate: i32,
}

impl LayoutAmounts {
    #[must_use]
    pub fn sum(&self) -> i64 {
        [
            self.address,
            self.assessor,
            self.comps,
            self.listing,
            self.recorder,
            self.rent_estimate,
            self.sale_estimate,
        ]
        .iter()
        .map(|v| i64::from(*v))
        .sum()
    }

    /// One unit for each layout in the mask.
    #[must_use]
    pub fn one_each(layouts: Layouts) -> Self {
        let unit = |l| i32::from(layouts.has(l));
        Self {
            address: unit(Layouts::ADDRESS),
            assessor: unit(Layouts::ASSESSOR),
            comps: unit(Layouts::COMPS),
            listing: unit(Layouts::LISTING),
            recorder: unit(Layouts::RECORDER),
            rent_estimate: unit(Layouts::RENT_ESTIMATE),
            sale_estimate: unit(Layouts::SALE_ESTIMATE),
        }
    }
}
