use crate::models::{
    Comment, Deleted, DeletedPost, EnrichedPost, FollowToggle, LikeToggle, MediaAttachment, MediaKind, MediaRef, NewComment, NewPost,
    NewStory, Notification, NotificationKind, Profile, ProfileUpdate, Story, StoryCard, StoryViewing, StoryViews, UnreadCount,
    User, UserSummary,
};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::routes::get_me,
        crate::routes::update_me,
        crate::routes::create_post,
        crate::routes::get_post,
        crate::routes::delete_post,
        crate::routes::toggle_like,
        crate::routes::list_comments,
        crate::routes::add_comment,
        crate::routes::delete_comment,
        crate::routes::toggle_follow,
        crate::routes::list_followers,
        crate::routes::list_following,
        crate::routes::search_users,
        crate::routes::get_profile,
        crate::routes::feed,
        crate::routes::trending,
        crate::routes::recommended,
        crate::routes::create_story,
        crate::routes::list_stories,
        crate::routes::view_story,
        crate::routes::delete_story,
        crate::routes::story_views,
        crate::routes::list_notifications,
        crate::routes::unread_count,
        crate::routes::upload_media,
        crate::routes::get_media,
    ),
    components(schemas(
        User, ProfileUpdate, UserSummary, Profile, MediaKind, MediaRef, MediaAttachment, NewPost, EnrichedPost, LikeToggle, FollowToggle,
        Comment, NewComment, Story, NewStory, StoryCard, StoryViewing, StoryViews, Notification, NotificationKind,
        Deleted, DeletedPost, UnreadCount, crate::routes::MediaUploadResponse
    )),
    modifiers(&BearerAuthAddon),
    security(("bearer_auth" = [])),
    tags(
        (name = "feed", description = "Posts, feed composition and trending"),
        (name = "reactions", description = "Likes and comments"),
        (name = "graph", description = "Follow relationships and user lookup"),
        (name = "stories", description = "Ephemeral stories"),
        (name = "notifications", description = "Engagement notifications"),
    )
)]
pub struct ApiDoc;

struct BearerAuthAddon;

impl utoipa::Modify for BearerAuthAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer_auth",
            SecurityScheme::Http(HttpBuilder::new().scheme(HttpAuthScheme::Bearer).bearer_format("JWT").build()),
        );
    }
}
