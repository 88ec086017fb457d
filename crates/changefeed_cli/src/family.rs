//! Sample family documents used to seed the reference store.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A family document, partitioned by `partitionKey`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Family {
    /// Document id.
    pub id: String,
    /// Partition key (the family's last name).
    pub partition_key: String,
    /// Last write timestamp stamped by the store.
    #[serde(rename = "_ts", default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<u64>,
    /// Family name.
    pub last_name: String,
    /// Parents.
    #[serde(default)]
    pub parents: Vec<Parent>,
    /// Children.
    #[serde(default)]
    pub children: Vec<Child>,
    /// Home address.
    pub address: Option<Address>,
    /// Whether the family is registered.
    #[serde(default)]
    pub is_registered: bool,
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = serde_json::to_string(self).map_err(|_| fmt::Error)?;
        f.write_str(&json)
    }
}

/// A parent.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Parent {
    /// Family name, if different from the family's.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub family_name: Option<String>,
    /// First name.
    pub first_name: String,
}

/// A child.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Child {
    /// Family name, if different from the family's.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub family_name: Option<String>,
    /// First name.
    pub first_name: String,
    /// Gender.
    pub gender: String,
    /// School grade.
    pub grade: u32,
    /// Pets.
    #[serde(default)]
    pub pets: Vec<Pet>,
}

/// A pet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pet {
    /// Name.
    pub given_name: String,
}

/// A postal address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Address {
    /// State.
    pub state: String,
    /// County.
    pub county: String,
    /// City.
    pub city: String,
}

fn pet(name: &str) -> Pet {
    Pet {
        given_name: name.to_string(),
    }
}

/// The Andersen family.
pub fn andersen() -> Family {
    Family {
        id: "Andersen.1".into(),
        partition_key: "Andersen".into(),
        ts: None,
        last_name: "Andersen".into(),
        parents: vec![
            Parent {
                family_name: None,
                first_name: "Thomas".into(),
            },
            Parent {
                family_name: None,
                first_name: "Mary Kay".into(),
            },
        ],
        children: vec![Child {
            family_name: None,
            first_name: "Henriette Thaulow".into(),
            gender: "female".into(),
            grade: 5,
            pets: vec![pet("Fluffy")],
        }],
        address: Some(Address {
            state: "WA".into(),
            county: "King".into(),
            city: "Seattle".into(),
        }),
        is_registered: false,
    }
}

/// The Wakefield family.
pub fn wakefield() -> Family {
    Family {
        id: "Wakefield.7".into(),
        partition_key: "Wakefield".into(),
        ts: None,
        last_name: "Wakefield".into(),
        parents: vec![
            Parent {
                family_name: Some("Wakefield".into()),
                first_name: "Robin".into(),
            },
            Parent {
                family_name: Some("Miller".into()),
                first_name: "Ben".into(),
            },
        ],
        children: vec![
            Child {
                family_name: Some("Merriam".into()),
                first_name: "Jesse".into(),
                gender: "female".into(),
                grade: 8,
                pets: vec![pet("Goofy"), pet("Shadow")],
            },
            Child {
                family_name: Some("Miller".into()),
                first_name: "Lisa".into(),
                gender: "female".into(),
                grade: 1,
                pets: Vec::new(),
            },
        ],
        address: Some(Address {
            state: "NY".into(),
            county: "Manhattan".into(),
            city: "NY".into(),
        }),
        is_registered: true,
    }
}

/// Both sample families.
pub fn samples() -> Vec<Family> {
    vec![andersen(), wakefield()]
}
