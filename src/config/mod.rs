pub mod schema;

pub use schema::{
    BitableConfig, Config, Credentials, LarkConfig, NotifyConfig, TaskFieldNames, ENV_APP_ID,
    ENV_APP_SECRET, ENV_APP_TOKEN,
};
