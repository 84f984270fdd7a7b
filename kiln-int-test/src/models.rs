use kiln::model::{Base, Validate};
use kiln::Model;
use serde::{Deserialize, Serialize};

#[derive(Model, Serialize, Deserialize, Default, Debug, Clone, PartialEq)]
#[model(collection = "posts")]
pub struct Post {
    #[serde(flatten)]
    pub base: Base,
    pub title: String,
    #[serde(default)]
    pub published: bool,
    #[serde(rename = "textBody", default)]
    pub text_body: String,
}

impl Post {
    pub fn new(title: &str) -> Self {
        Post {
            title: title.to_string(),
            ..Default::default()
        }
    }
}

impl Validate for Post {
    fn validate(&self) -> anyhow::Result<()> {
        if self.title.is_empty() {
            anyhow::bail!("missing title");
        }
        Ok(())
    }
}

#[derive(Model, Serialize, Deserialize, Default, Debug, Clone, PartialEq)]
#[model(collection = "counters")]
#[serde(rename_all = "camelCase")]
pub struct Counter {
    #[serde(flatten)]
    pub base: Base,
    pub name: String,
    pub total_count: i64,
}

impl Counter {
    pub fn new(name: &str) -> Self {
        Counter {
            name: name.to_string(),
            ..Default::default()
        }
    }
}

impl Validate for Counter {}
