//! Directory records and the forms that create them.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::ValidationError;
use crate::{Timestamp, UserId};

// ============================================================================
// RECORDS
// ============================================================================

/// Row of the `users` table as listed in the member directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectoryUser {
    pub id: UserId,
    pub full_name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub hometown: Option<String>,
    #[serde(default)]
    pub created_at: Option<Timestamp>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub category_id: i64,
    pub category_name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub icon_url: Option<String>,
}

/// Embedded `categories(category_name)` relation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryName {
    pub category_name: String,
}

/// Embedded `users(full_name, hometown)` relation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserName {
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub hometown: Option<String>,
}

/// Embedded `locations(location_name)` relation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationName {
    pub location_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub location_id: i64,
    pub location_name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub category_id: Option<i64>,
    #[serde(default)]
    pub added_by_id: Option<UserId>,
    #[serde(default)]
    pub date_added: Option<Timestamp>,
    #[serde(default, rename = "categories")]
    pub category: Option<CategoryName>,
    #[serde(default, rename = "users")]
    pub added_by: Option<UserName>,
}

impl Location {
    pub fn category_name(&self) -> Option<&str> {
        self.category.as_ref().map(|c| c.category_name.as_str())
    }

    pub fn added_by_name(&self) -> Option<&str> {
        self.added_by.as_ref().and_then(|u| u.full_name.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Review {
    pub review_id: i64,
    #[serde(default)]
    pub location_id: Option<i64>,
    #[serde(default)]
    pub user_id: Option<UserId>,
    pub rating: i32,
    #[serde(default)]
    pub review_text: Option<String>,
    #[serde(default)]
    pub photo_url: Option<String>,
    #[serde(default)]
    pub review_date: Option<Timestamp>,
    #[serde(default, rename = "locations")]
    pub location: Option<LocationName>,
    #[serde(default, rename = "users")]
    pub reviewer: Option<UserName>,
}

impl Review {
    pub fn location_name(&self) -> Option<&str> {
        self.location.as_ref().map(|l| l.location_name.as_str())
    }

    pub fn reviewer_name(&self) -> Option<&str> {
        self.reviewer.as_ref().and_then(|u| u.full_name.as_deref())
    }
}

/// Option for a form dropdown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectOption {
    pub id: String,
    pub label: String,
}

/// Row counts shown on the home page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteStats {
    pub total_locations: u64,
    pub total_reviews: u64,
    pub total_users: u64,
    pub total_categories: u64,
}

/// Everything the home page shows. Failed parts degrade to empty values and
/// their messages are collected in `errors`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HomeOverview {
    pub recent_locations: Vec<Location>,
    pub top_reviews: Vec<Review>,
    pub stats: SiteStats,
    #[serde(default)]
    pub errors: Vec<String>,
}

// ============================================================================
// FORMS
// ============================================================================

fn require(field: &str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::required(field));
    }
    Ok(())
}

fn blank_to_none(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Manually added directory member.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewUser {
    pub full_name: String,
    pub email: String,
    pub hometown: String,
}

impl NewUser {
    pub fn validate(&self) -> Result<(), ValidationError> {
        require("full_name", &self.full_name)?;
        require("email", &self.email)?;
        if !self.email.contains('@') {
            return Err(ValidationError::invalid("email", "must contain '@'"));
        }
        require("hometown", &self.hometown)
    }

    pub fn to_row(&self, id: UserId) -> Value {
        json!({
            "id": id,
            "full_name": self.full_name.trim(),
            "email": self.email.trim(),
            "hometown": self.hometown.trim(),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewCategory {
    pub category_name: String,
    pub description: Option<String>,
    pub icon_url: Option<String>,
}

impl NewCategory {
    pub fn validate(&self) -> Result<(), ValidationError> {
        require("category_name", &self.category_name)
    }

    pub fn to_row(&self) -> Value {
        json!({
            "category_name": self.category_name.trim(),
            "description": blank_to_none(&self.description),
            "icon_url": blank_to_none(&self.icon_url),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewLocation {
    pub location_name: String,
    pub description: String,
    pub address: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub category_id: Option<i64>,
}

impl NewLocation {
    pub fn validate(&self) -> Result<(), ValidationError> {
        require("location_name", &self.location_name)?;
        require("description", &self.description)?;
        if self.category_id.is_none() {
            return Err(ValidationError::required("category_id"));
        }
        if let Some(lat) = self.latitude {
            if !(-90.0..=90.0).contains(&lat) {
                return Err(ValidationError::invalid("latitude", "must be within [-90, 90]"));
            }
        }
        if let Some(lng) = self.longitude {
            if !(-180.0..=180.0).contains(&lng) {
                return Err(ValidationError::invalid(
                    "longitude",
                    "must be within [-180, 180]",
                ));
            }
        }
        Ok(())
    }

    /// Row to insert; `added_by_id` is always the signed-in user.
    pub fn to_row(&self, added_by_id: UserId) -> Value {
        json!({
            "location_name": self.location_name.trim(),
            "description": self.description.trim(),
            "address": blank_to_none(&self.address),
            "latitude": self.latitude,
            "longitude": self.longitude,
            "category_id": self.category_id,
            "added_by_id": added_by_id,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewReview {
    pub location_id: Option<i64>,
    pub rating: Option<i32>,
    pub review_text: String,
    pub photo_url: Option<String>,
}

impl NewReview {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.location_id.is_none() {
            return Err(ValidationError::required("location_id"));
        }
        match self.rating {
            None => return Err(ValidationError::required("rating")),
            Some(r) if !(1..=5).contains(&r) => {
                return Err(ValidationError::invalid("rating", "must be between 1 and 5"));
            }
            Some(_) => {}
        }
        require("review_text", &self.review_text)
    }

    /// Row to insert; `user_id` is always the signed-in user.
    pub fn to_row(&self, user_id: UserId) -> Value {
        json!({
            "location_id": self.location_id,
            "user_id": user_id,
            "rating": self.rating,
            "review_text": self.review_text.trim(),
            "photo_url": blank_to_none(&self.photo_url),
        })
    }
}
