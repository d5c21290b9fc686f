// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

/// Maps collection sizes to partitions and partitions to slot capacities.
///
/// Partition `n` holds collections of `(L^n, L^(n+1)]` rows in slots of
/// capacity `L^(n+1)`; partition 0 additionally covers sizes `1..=L`.
#[derive(Copy, Clone, Debug)]
pub struct PartitionSizing {
    load_factor: u8,
    max_partitions: u8,
}

impl PartitionSizing {
    /// Creates a sizing scheme.
    ///
    /// # Panics
    ///
    /// Panics if the load factor is less than 2, if no partition is allowed,
    /// or if the largest slot capacity would not fit into a `u32`.
    #[must_use]
    pub fn new(load_factor: u8, max_partitions: u8) -> Self {
        assert!(load_factor >= 2, "load factor must be at least 2");
        assert!(max_partitions > 0, "need at least one partition");
        assert!(
            u64::from(load_factor).pow(u32::from(max_partitions)) <= u64::from(u32::MAX),
            "largest slot capacity overflows u32",
        );

        Self {
            load_factor,
            max_partitions,
        }
    }

    /// The configured geometric growth ratio.
    #[must_use]
    pub fn load_factor(&self) -> u8 {
        self.load_factor
    }

    /// Number of partitions; valid partition indexes are `0..max_partitions`.
    #[must_use]
    pub fn max_partitions(&self) -> u8 {
        self.max_partitions
    }

    /// Slot capacity of partition `n`, in rows (`L^(n+1)`).
    #[must_use]
    pub fn slot_capacity(&self, n: u8) -> u32 {
        debug_assert!(n < self.max_partitions);

        u32::from(self.load_factor).pow(u32::from(n) + 1)
    }

    /// Largest slot capacity any partition may have (`L^max_partitions`).
    #[must_use]
    pub fn largest_slot_capacity(&self) -> u32 {
        u32::from(self.load_factor).pow(u32::from(self.max_partitions))
    }

    /// Least partition whose slots can hold `count` rows.
    ///
    /// # Errors
    ///
    /// Fails with `CapacityExceeded` if `count` does not fit the highest
    /// configured partition.
    pub fn partition_for(&self, count: u32) -> crate::Result<u8> {
        let count = u64::from(count.max(1));

        let mut n = 0u8;
        let mut capacity = u64::from(self.load_factor);

        while capacity < count {
            n += 1;

            if n >= self.max_partitions {
                return Err(crate::Error::CapacityExceeded {
                    partition: n,
                    max: self.max_partitions,
                });
            }

            capacity *= u64::from(self.load_factor);
        }

        Ok(n)
    }
}
