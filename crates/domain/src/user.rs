use crate::value_objects::{ImageRef, UserId};

/// 默认头像路径
pub const DEFAULT_AVATAR_URL: &str = "/media/profile_pics/default_avatar.png";

/// 用户目录中的用户资料（用户本身由外部系统管理）
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    pub username: Option<String>,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub profile_pic: Option<ImageRef>,
}

impl UserProfile {
    pub fn new(id: UserId, username: Option<String>, email: impl Into<String>) -> Self {
        Self {
            id,
            username: username.filter(|name| !name.trim().is_empty()),
            email: email.into(),
            first_name: String::new(),
            last_name: String::new(),
            profile_pic: None,
        }
    }

    pub fn with_names(mut self, first_name: impl Into<String>, last_name: impl Into<String>) -> Self {
        self.first_name = first_name.into();
        self.last_name = last_name.into();
        self
    }

    /// 用户名 → 邮箱 → "User ID {id}"
    pub fn display_name(&self) -> String {
        if let Some(username) = self.username.as_deref().filter(|name| !name.is_empty()) {
            return username.to_string();
        }
        if !self.email.is_empty() {
            return self.email.clone();
        }
        fallback_display_name(self.id)
    }

    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }

    /// 输入提示中展示的名字：全名优先
    pub fn typing_name(&self) -> String {
        let full_name = self.full_name();
        if full_name.is_empty() {
            self.display_name()
        } else {
            full_name
        }
    }

    pub fn profile_pic_url(&self) -> String {
        self.profile_pic
            .as_ref()
            .map(ImageRef::url)
            .unwrap_or_else(|| DEFAULT_AVATAR_URL.to_string())
    }
}

pub fn fallback_display_name(id: UserId) -> String {
    format!("User ID {id}")
}
