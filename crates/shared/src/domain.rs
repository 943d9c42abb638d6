use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize};

/// Server ids arrive as JSON strings or numbers depending on the endpoint.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Int(i64),
    Float(f64),
}

impl RawId {
    fn into_string(self) -> String {
        match self {
            RawId::Text(value) => value,
            RawId::Int(value) => value.to_string(),
            RawId::Float(value) if value.fract() == 0.0 => format!("{}", value as i64),
            RawId::Float(value) => value.to_string(),
        }
    }
}

pub(crate) fn deserialize_id_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(RawId::deserialize(deserializer)?.into_string())
}

pub(crate) fn deserialize_optional_id_string<'de, D>(
    deserializer: D,
) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<RawId>::deserialize(deserializer)?
        .map(RawId::into_string)
        .filter(|value| !value.is_empty()))
}

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                deserialize_id_string(deserializer).map(Self)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(ChannelId);
id_newtype!(MessageId);

/// Routing key used to fan envelopes out to interested subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    Channel(ChannelId),
    User(UserId),
}

impl Topic {
    pub fn channel(id: impl Into<ChannelId>) -> Self {
        Topic::Channel(id.into())
    }

    pub fn user(id: impl Into<UserId>) -> Self {
        Topic::User(id.into())
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Channel(id) => write!(f, "channel:{id}"),
            Topic::User(id) => write!(f, "user:{id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid topic '{0}': expected channel:{{id}} or user:{{id}}")]
pub struct InvalidTopic(pub String);

impl FromStr for Topic {
    type Err = InvalidTopic;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let (prefix, id) = raw
            .split_once(':')
            .ok_or_else(|| InvalidTopic(raw.to_string()))?;
        if id.is_empty() {
            return Err(InvalidTopic(raw.to_string()));
        }
        match prefix {
            "channel" => Ok(Topic::channel(id)),
            "user" => Ok(Topic::user(id)),
            _ => Err(InvalidTopic(raw.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    #[default]
    Group,
    Direct,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default, alias = "profilePicture")]
    pub avatar: Option<String>,
}
