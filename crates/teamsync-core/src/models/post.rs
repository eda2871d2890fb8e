use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::UserSummary;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct Post {
    pub id: String,
    pub author: UserSummary,
    pub content: String,
    #[serde(rename = "likeCount", default)]
    pub like_count: u32,
    #[serde(rename = "commentCount", default)]
    pub comment_count: u32,
    #[serde(rename = "likedByMe", default)]
    pub liked_by_me: bool,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct Comment {
    pub id: String,
    #[serde(rename = "postId")]
    pub post_id: String,
    pub author: UserSummary,
    pub content: String,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}
