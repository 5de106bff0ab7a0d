use snafu::Snafu;

use crate::codec::{CompressionType, CsumType, EncryptionKey};

/// Bytes per sector. All on-disk sizes and offsets are tracked in sectors.
pub const SECTOR_SIZE: usize = 512;

/// Bytes per page, the bounce-pool allocation granule.
pub const PAGE_SIZE: usize = 4096;

// A single encoded extent never exceeds 128KiB.  This bounds the size of any
// one bounce allocation, and therefore the size of the slabs the reserved
// pool hands out when direct allocation fails.
pub const DEFAULT_ENCODED_EXTENT_MAX: usize = 128 * 1024;

// Checksummed-but-uncompressed extents are kept smaller so that a torn read
// only ever has to reread a modest region to reverify.
pub const DEFAULT_ENCODED_EXTENT_MAX_CSUM: usize = 64 * 1024;

// Enough reserved slabs to let one read and one write make progress each,
// plus one for a concurrent move pass.
pub const DEFAULT_BOUNCE_RESERVE_SLABS: usize = 3;

// Open buckets are carved out of devices in fixed-size runs.
pub const DEFAULT_BUCKET_SIZE: usize = 256 * 1024;

// A move pass keeps at most this many bytes of reads in flight before it
// waits for writes to drain.
pub const DEFAULT_MOVE_BYTES_IN_FLIGHT: usize = 1024 * 1024;

/// Error produced when invalid parameters are given to [`DataPathConfigBuilder`].
#[derive(Debug, Snafu)]
pub enum BuildError {
    #[snafu(display("parameter '{}' was invalid: {}", param_name, reason))]
    InvalidParameter {
        param_name: &'static str,
        reason: String,
    },
}

/// Data-path configuration.
#[derive(Clone, Debug)]
pub struct DataPathConfig {
    /// Default checksum type for foreground writes.
    pub(crate) csum_type: CsumType,

    /// Default compression type for foreground writes.
    pub(crate) compression: CompressionType,

    /// Replication goal for dirty extents.
    pub(crate) replicas: u32,

    /// Filesystem-wide encryption key.  When present, all payloads are
    /// encrypted in flight and the checksum type is forced to an
    /// authenticated one.
    pub(crate) encryption_key: Option<EncryptionKey>,

    /// Maximum size, in bytes, of a single encoded extent.
    ///
    /// Acquisitions from the bounce pool at or below this size never fail.
    pub(crate) encoded_extent_max: usize,

    /// Maximum size, in bytes, of a checksummed-but-uncompressed extent.
    pub(crate) encoded_extent_max_csum: usize,

    /// Number of reserved bounce slabs guaranteeing forward progress when
    /// direct page allocation fails.
    pub(crate) bounce_reserve_slabs: usize,

    /// Size, in bytes, of the open buckets the allocator hands to write
    /// points.
    pub(crate) bucket_size: usize,

    /// Tier to which freshly-read extents are promoted, if any.
    ///
    /// Tier 0 is the fastest.  `None` disables promotion.
    pub(crate) promote_tier: Option<u8>,

    /// Byte budget for reads a move pass may keep in flight.
    pub(crate) move_bytes_in_flight: usize,
}

impl DataPathConfig {
    pub fn builder() -> DataPathConfigBuilder {
        DataPathConfigBuilder::default()
    }

    /// The default I/O options foreground writes inherit.
    pub fn io_opts(&self) -> IoOpts {
        IoOpts {
            csum: self.csum_type,
            compression: self.compression,
            replicas: self.replicas,
        }
    }
}

/// Per-operation I/O options: checksum, compression, replication.
#[derive(Clone, Copy, Debug)]
pub struct IoOpts {
    pub csum: CsumType,
    pub compression: CompressionType,
    pub replicas: u32,
}

/// Builder for [`DataPathConfig`].
#[derive(Clone, Debug, Default)]
pub struct DataPathConfigBuilder {
    csum_type: Option<CsumType>,
    compression: Option<CompressionType>,
    replicas: Option<u32>,
    encryption_key: Option<EncryptionKey>,
    encoded_extent_max: Option<usize>,
    encoded_extent_max_csum: Option<usize>,
    bounce_reserve_slabs: Option<usize>,
    bucket_size: Option<usize>,
    promote_tier: Option<u8>,
    move_bytes_in_flight: Option<usize>,
}

impl DataPathConfigBuilder {
    /// Sets the default checksum type for foreground writes.
    ///
    /// Defaults to crc32c.
    pub fn csum_type(mut self, csum_type: CsumType) -> Self {
        self.csum_type = Some(csum_type);
        self
    }

    /// Sets the default compression type for foreground writes.
    ///
    /// Defaults to no compression.
    pub fn compression(mut self, compression: CompressionType) -> Self {
        self.compression = Some(compression);
        self
    }

    /// Sets the replication goal for dirty extents.
    ///
    /// Defaults to 1.
    pub fn replicas(mut self, replicas: u32) -> Self {
        self.replicas = Some(replicas);
        self
    }

    /// Enables encryption with the given key.
    ///
    /// Payload checksums switch to the authenticated chacha-poly type; a
    /// conflicting `csum_type` is rejected at build time.
    pub fn encryption_key(mut self, key: EncryptionKey) -> Self {
        self.encryption_key = Some(key);
        self
    }

    /// Sets the maximum size, in bytes, of a single encoded extent.
    ///
    /// Defaults to 128KiB.  Must be a multiple of the page size.
    pub fn encoded_extent_max(mut self, amount: usize) -> Self {
        self.encoded_extent_max = Some(amount);
        self
    }

    /// Sets the maximum size, in bytes, of a checksummed-but-uncompressed
    /// extent.
    ///
    /// Defaults to 64KiB.  Must not exceed `encoded_extent_max`.
    pub fn encoded_extent_max_csum(mut self, amount: usize) -> Self {
        self.encoded_extent_max_csum = Some(amount);
        self
    }

    /// Sets the number of reserved bounce slabs.
    ///
    /// Defaults to 3.
    pub fn bounce_reserve_slabs(mut self, slabs: usize) -> Self {
        self.bounce_reserve_slabs = Some(slabs);
        self
    }

    /// Sets the open-bucket size, in bytes.
    ///
    /// Defaults to 256KiB.  Must be a sector multiple at least as large as
    /// `encoded_extent_max`, so an encoded extent always fits one bucket.
    pub fn bucket_size(mut self, amount: usize) -> Self {
        self.bucket_size = Some(amount);
        self
    }

    /// Sets the tier freshly-read extents are promoted to.
    ///
    /// Defaults to disabled.
    pub fn promote_tier(mut self, tier: u8) -> Self {
        self.promote_tier = Some(tier);
        self
    }

    /// Sets the byte budget for reads a move pass keeps in flight.
    ///
    /// Defaults to 1MiB.
    pub fn move_bytes_in_flight(mut self, amount: usize) -> Self {
        self.move_bytes_in_flight = Some(amount);
        self
    }

    /// Consumes this builder and constructs a `DataPathConfig`.
    pub fn build(self) -> Result<DataPathConfig, BuildError> {
        let csum_type = self.csum_type.unwrap_or(CsumType::Crc32c);
        let compression = self.compression.unwrap_or(CompressionType::None);
        let replicas = self.replicas.unwrap_or(1);
        let encoded_extent_max = self.encoded_extent_max.unwrap_or(DEFAULT_ENCODED_EXTENT_MAX);
        let encoded_extent_max_csum = self
            .encoded_extent_max_csum
            .unwrap_or(DEFAULT_ENCODED_EXTENT_MAX_CSUM);
        let bounce_reserve_slabs = self
            .bounce_reserve_slabs
            .unwrap_or(DEFAULT_BOUNCE_RESERVE_SLABS);
        let bucket_size = self.bucket_size.unwrap_or(DEFAULT_BUCKET_SIZE);
        let move_bytes_in_flight = self
            .move_bytes_in_flight
            .unwrap_or(DEFAULT_MOVE_BYTES_IN_FLIGHT);

        if replicas == 0 || replicas > crate::extent::MAX_REPLICAS {
            return Err(BuildError::InvalidParameter {
                param_name: "replicas",
                reason: format!("must be between 1 and {}", crate::extent::MAX_REPLICAS),
            });
        }

        if encoded_extent_max == 0 || encoded_extent_max % PAGE_SIZE != 0 {
            return Err(BuildError::InvalidParameter {
                param_name: "encoded_extent_max",
                reason: format!("must be a non-zero multiple of {}", PAGE_SIZE),
            });
        }

        if encoded_extent_max_csum == 0 || encoded_extent_max_csum > encoded_extent_max {
            return Err(BuildError::InvalidParameter {
                param_name: "encoded_extent_max_csum",
                reason: "must be non-zero and no larger than encoded_extent_max".to_string(),
            });
        }

        if bucket_size % SECTOR_SIZE != 0 || bucket_size < encoded_extent_max {
            return Err(BuildError::InvalidParameter {
                param_name: "bucket_size",
                reason: format!(
                    "must be a sector multiple of at least {} bytes",
                    encoded_extent_max
                ),
            });
        }

        if self.encryption_key.is_some() {
            if csum_type != CsumType::ChachaPoly {
                return Err(BuildError::InvalidParameter {
                    param_name: "csum_type",
                    reason: "encryption requires the chacha-poly checksum type".to_string(),
                });
            }
        } else if csum_type == CsumType::ChachaPoly {
            return Err(BuildError::InvalidParameter {
                param_name: "csum_type",
                reason: "chacha-poly checksums require an encryption key".to_string(),
            });
        }

        Ok(DataPathConfig {
            csum_type,
            compression,
            replicas,
            encryption_key: self.encryption_key,
            encoded_extent_max,
            encoded_extent_max_csum,
            bounce_reserve_slabs,
            bucket_size,
            promote_tier: self.promote_tier,
            move_bytes_in_flight,
        })
    }
}

#[cfg(test)]
mod tests {
    use proptest::{prop_assert, proptest};

    use super::*;

    #[test]
    fn encryption_forces_authenticated_checksums() {
        let err = DataPathConfig::builder()
            .encryption_key(EncryptionKey::from_bytes([7; 32]))
            .csum_type(CsumType::Crc32c)
            .build()
            .unwrap_err();
        assert!(matches!(err, BuildError::InvalidParameter { param_name, .. } if param_name == "csum_type"));

        let ok = DataPathConfig::builder()
            .encryption_key(EncryptionKey::from_bytes([7; 32]))
            .csum_type(CsumType::ChachaPoly)
            .build();
        assert!(ok.is_ok());
    }

    #[test]
    fn chacha_poly_requires_key() {
        let err = DataPathConfig::builder()
            .csum_type(CsumType::ChachaPoly)
            .build()
            .unwrap_err();
        assert!(matches!(err, BuildError::InvalidParameter { .. }));
    }

    proptest! {
        #[test]
        fn bucket_always_fits_an_encoded_extent(pages in 1usize..64) {
            let encoded_extent_max = pages * PAGE_SIZE;
            let config = DataPathConfig::builder()
                .encoded_extent_max(encoded_extent_max)
                .encoded_extent_max_csum(encoded_extent_max.min(DEFAULT_ENCODED_EXTENT_MAX_CSUM))
                .bucket_size(encoded_extent_max.max(DEFAULT_BUCKET_SIZE))
                .build()
                .expect("valid parameters");
            prop_assert!(config.bucket_size >= config.encoded_extent_max);
        }
    }
}
