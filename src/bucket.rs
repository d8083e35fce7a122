use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

/// Lowest bucket a rollout can assign.
pub const MIN_BUCKET: u8 = 1;
/// Highest bucket a rollout can assign.
pub const MAX_BUCKET: u8 = 100;

/// Identifies the salt composition used to bucket identities.
///
/// Changing the composition reshuffles every identity's bucket, so a new composition must come
/// with a new version rather than replace the current one in place.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BucketingVersion {
    /// `MD5(salt + ":" + feature)` read as a base-16 integer, `mod 100`, plus one.
    #[default]
    V1,
}

impl BucketingVersion {
    /// Bucket (1..=100) of `salt` for `feature_name` under this version's formula.
    pub fn bucket(self, salt: &BucketSalt, feature_name: &str) -> u8 {
        match self {
            BucketingVersion::V1 => {
                let mut hash = Md5::new();
                salt.write_hash(&mut hash);
                hash.update(b":");
                hash.update(feature_name.as_bytes());
                (hash_value(hash) % 100) as u8 + MIN_BUCKET
            }
        }
    }
}

/// Which identity string percentage rollouts hash on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SaltMode {
    /// `clientId + ":" + userId`: the same user lands in independent buckets per client.
    #[default]
    ClientAndUser,
    /// `userId` alone: the same user lands in the same bucket whichever client asks.
    User,
}

/// The identity half of the bucketing input.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BucketSalt<'a> {
    ClientAndUser(&'a str, &'a str),
    User(&'a str),
}

impl<'a> BucketSalt<'a> {
    pub fn new(mode: SaltMode, client_id: &'a str, user_id: &'a str) -> Self {
        match mode {
            SaltMode::ClientAndUser => BucketSalt::ClientAndUser(client_id, user_id),
            SaltMode::User => BucketSalt::User(user_id),
        }
    }

    fn write_hash(&self, hash: &mut Md5) {
        match self {
            BucketSalt::ClientAndUser(client_id, user_id) => {
                hash.update(client_id.as_bytes());
                hash.update(b":");
                hash.update(user_id.as_bytes());
            }
            BucketSalt::User(user_id) => {
                hash.update(user_id.as_bytes());
            }
        }
    }

    /// Bucket (1..=100) of this identity for `feature_name`.
    pub fn bucket(&self, version: BucketingVersion, feature_name: &str) -> u8 {
        version.bucket(self, feature_name)
    }

    /// True when this identity's bucket for `feature_name` falls inside a `percentage` rollout.
    pub fn in_rollout(&self, version: BucketingVersion, feature_name: &str, percentage: u8) -> bool {
        passes_percentage(self.bucket(version, feature_name), percentage)
    }
}

/// A bucket passes a rollout when it is at most the rollout percentage, so 0% admits nobody and
/// 100% admits everybody.
pub fn passes_percentage(bucket: u8, percentage: u8) -> bool {
    bucket <= percentage
}

/// Deterministically assigns `user_id` to one of `groups` for the experiment `test_name`.
///
/// Returns None when no groups are configured.
pub fn assign_ab_group<'g, S: AsRef<str>>(
    user_id: &str,
    test_name: &str,
    groups: &'g [S],
) -> Option<&'g str> {
    if groups.is_empty() {
        return None;
    }
    let mut hash = Md5::new();
    hash.update(user_id.as_bytes());
    hash.update(b":");
    hash.update(test_name.as_bytes());
    let index = (hash_value(hash) % groups.len() as u128) as usize;
    groups.get(index).map(AsRef::as_ref)
}

fn hash_value(hash: Md5) -> u128 {
    let digest = hash.finalize();
    let hexhash = base16ct::lower::encode_string(&digest);
    // an md5 digest is 32 hex digits, which always fits in 128 bits
    u128::from_str_radix(&hexhash, 16).unwrap_or_default()
}
