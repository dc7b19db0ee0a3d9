//! Identifiers for stored entities.
//!
//! Every identifier is a ULID wrapped in its own newtype so a campaign id can
//! never be handed to something expecting a send id. ULIDs sort by creation
//! time, which gives sends a stable dispatch order for free.

macro_rules! ulid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name {
            id: ulid::Ulid,
        }

        impl $name {
            /// Create an identifier from an existing ULID
            #[must_use]
            pub const fn new(id: ulid::Ulid) -> Self {
                Self { id }
            }

            /// Generate a new unique identifier
            #[must_use]
            pub fn generate() -> Self {
                Self {
                    id: ulid::Ulid::new(),
                }
            }

            /// Get the underlying ULID
            #[must_use]
            pub const fn ulid(&self) -> ulid::Ulid {
                self.id
            }

            /// Milliseconds since the Unix epoch encoded in this identifier
            #[must_use]
            pub const fn timestamp_ms(&self) -> u64 {
                self.id.timestamp_ms()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.id)
            }
        }

        impl std::str::FromStr for $name {
            type Err = ulid::DecodeError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self {
                    id: ulid::Ulid::from_string(s)?,
                })
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_str(&self.id.to_string())
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                let id = ulid::Ulid::from_string(&s).map_err(serde::de::Error::custom)?;
                Ok(Self { id })
            }
        }
    };
}

ulid_id!(
    /// Identifier of a tenant account
    AccountId
);

ulid_id!(
    /// Identifier of a campaign
    CampaignId
);

ulid_id!(
    /// Identifier of one campaign x recipient send record
    SendId
);

ulid_id!(
    /// Identifier of a subscriber (recipient) owned by a list
    SubscriberId
);

ulid_id!(
    /// Identifier of a subscriber list
    ListId
);

ulid_id!(
    /// Identifier of a segment of a list
    SegmentId
);

ulid_id!(
    /// Identifier of an email template
    TemplateId
);
