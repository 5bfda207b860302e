//! OpenAPI documentation.

use utoipa::OpenApi;

/// OpenAPI specification for the JSON management surface.
///
/// The HTML view routes and embedded assets are intentionally left out.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "nga-mirror API",
        description = "Topic lifecycle, subscriptions, and transfer records",
        license(name = "MIT OR Apache-2.0")
    ),
    paths(
        crate::api::routes::topics::list_topics,
        crate::api::routes::topics::get_topic,
        crate::api::routes::topics::add_topic,
        crate::api::routes::topics::update_topic,
        crate::api::routes::topics::delete_topic,
        crate::api::routes::topics::fresh_topic,
        crate::api::routes::subscribe::subscription_status,
        crate::api::routes::subscribe::subscribe,
        crate::api::routes::subscribe::unsubscribe,
        crate::api::routes::subscribe::batch_users,
    ),
    components(schemas(
        crate::types::TopicId,
        crate::types::Metadata,
        crate::types::DownResult,
        crate::types::TransferStatus,
        crate::types::TransferRecord,
        crate::types::UserRecord,
        crate::topic::TopicView,
        crate::topic::MetadataView,
    )),
    tags(
        (name = "topics", description = "Topic lifecycle"),
        (name = "subscriptions", description = "Author subscriptions")
    )
)]
pub struct ApiDoc;
