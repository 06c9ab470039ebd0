//! Who else is in the document.
//!
//! The roster is filled from the join response, kept current by
//! presence-joined / presence-left messages and cleared on disconnect.
//! The local user is never listed.

use std::collections::HashMap;

use stagehand_core::UserId;

use crate::protocol::UserInfo;

/// Stable, visually distinct `#rrggbb` color for a user id.
///
/// The hue comes from the id; saturation and lightness are fixed so every
/// user gets a vivid color.
pub fn color_for(user_id: UserId) -> String {
    let hue = (user_id.as_u128() % 360) as f32 / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
    format!(
        "#{:02x}{:02x}{:02x}",
        (r * 255.0).round() as u8,
        (g * 255.0).round() as u8,
        (b * 255.0).round() as u8
    )
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        p + (q - p) * 6.0 * t
    } else if t < 0.5 {
        q
    } else if t < 2.0 / 3.0 {
        p + (q - p) * (2.0 / 3.0 - t) * 6.0
    } else {
        p
    }
}

#[derive(Debug, Default)]
pub struct PresenceRoster {
    local_user: Option<UserId>,
    users: HashMap<UserId, UserInfo>,
}

impl PresenceRoster {
    pub fn new(local_user: UserId) -> Self {
        Self {
            local_user: Some(local_user),
            users: HashMap::new(),
        }
    }

    /// Replace the roster with the users listed in a join response.
    pub fn replace(&mut self, users: Vec<UserInfo>) {
        self.users.clear();
        for user in users {
            self.join(user);
        }
    }

    /// Returns `false` for the local user and for users already listed.
    pub fn join(&mut self, user: UserInfo) -> bool {
        if Some(user.user_id) == self.local_user {
            return false;
        }
        let is_new = !self.users.contains_key(&user.user_id);
        if is_new {
            log::info!("{} ({}) joined", user.name, user.user_id);
        }
        self.users.insert(user.user_id, user);
        is_new
    }

    pub fn leave(&mut self, user_id: UserId) -> Option<UserInfo> {
        let user = self.users.remove(&user_id);
        if let Some(ref u) = user {
            log::info!("{} ({}) left", u.name, u.user_id);
        }
        user
    }

    pub fn get(&self, user_id: UserId) -> Option<&UserInfo> {
        self.users.get(&user_id)
    }

    pub fn contains(&self, user_id: UserId) -> bool {
        self.users.contains_key(&user_id)
    }

    /// Users sorted by name.
    pub fn users(&self) -> Vec<UserInfo> {
        let mut users: Vec<UserInfo> = self.users.values().cloned().collect();
        users.sort_by(|a, b| a.name.cmp(&b.name).then(a.user_id.cmp(&b.user_id)));
        users
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn clear(&mut self) {
        self.users.clear();
    }
}
