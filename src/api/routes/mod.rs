//! API route handlers.

pub mod pan;
pub mod statics;
pub mod subscribe;
pub mod topics;
pub mod view;

pub use pan::{list_transfers, operate_transfer};
pub use statics::{favicon, home_page, static_asset};
pub use subscribe::{batch_users, subscribe, subscription_status, unsubscribe};
pub use topics::{add_topic, delete_topic, fresh_topic, get_topic, list_topics, update_topic};
pub use view::{force_reload, view_asset, view_topic};
