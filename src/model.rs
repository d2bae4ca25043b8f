use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only time type.
pub type Ms = i64;

/// One reservation of a residency by a user. Never mutated in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub residency_id: String,
    pub date: Ms,
}

impl Booking {
    pub fn new(residency_id: impl Into<String>, date: Ms) -> Self {
        Self {
            residency_id: residency_id.into(),
            date,
        }
    }
}

/// A user record keyed by email.
///
/// `booked_visits` is a set keyed by `residency_id`; `fav_residencies_id` is a
/// set of residency ids. Both are stored as vectors in insertion order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Ulid,
    pub email: String,
    pub name: Option<String>,
    pub image: Option<String>,
    pub booked_visits: Vec<Booking>,
    pub fav_residencies_id: Vec<String>,
}

impl User {
    /// New user with both collections empty.
    pub fn new(email: impl Into<String>, name: Option<String>, image: Option<String>) -> Self {
        Self {
            id: Ulid::new(),
            email: email.into(),
            name,
            image,
            booked_visits: Vec::new(),
            fav_residencies_id: Vec::new(),
        }
    }

    pub fn has_booking(&self, residency_id: &str) -> bool {
        self.booked_visits
            .iter()
            .any(|b| b.residency_id == residency_id)
    }

    pub fn is_favorite(&self, residency_id: &str) -> bool {
        self.fav_residencies_id.iter().any(|r| r == residency_id)
    }

    /// Apply a patch in place. Push appends, Set replaces.
    pub fn apply(&mut self, patch: &UserPatch) {
        match patch {
            UserPatch::PushBooking(booking) => self.booked_visits.push(booking.clone()),
            UserPatch::SetBookings(bookings) => self.booked_visits = bookings.clone(),
            UserPatch::PushFavorite(rid) => self.fav_residencies_id.push(rid.clone()),
            UserPatch::SetFavorites(rids) => self.fav_residencies_id = rids.clone(),
        }
    }

    /// Copy out only the requested fields.
    pub fn project(&self, fields: &[Field]) -> UserProjection {
        let mut out = UserProjection::default();
        for field in fields {
            match field {
                Field::BookedVisits => out.booked_visits = Some(self.booked_visits.clone()),
                Field::FavResidenciesId => {
                    out.fav_residencies_id = Some(self.fav_residencies_id.clone())
                }
            }
        }
        out
    }
}

/// Collection fields that can be projected out of a user record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    BookedVisits,
    FavResidenciesId,
}

/// Partial user: a field is `Some` only if it was requested.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserProjection {
    pub booked_visits: Option<Vec<Booking>>,
    pub fav_residencies_id: Option<Vec<String>>,
}

/// A single-collection update: append to it or replace it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserPatch {
    PushBooking(Booking),
    SetBookings(Vec<Booking>),
    PushFavorite(String),
    SetFavorites(Vec<String>),
}

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    UserCreated { user: User },
    UserPatched { email: String, patch: UserPatch },
}

impl Event {
    pub fn email(&self) -> &str {
        match self {
            Event::UserCreated { user } => &user.email,
            Event::UserPatched { email, .. } => email,
        }
    }
}

// ── Operation result types ───────────────────────────────────────

/// What `toggle_favorite` did to the favorites set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleAction {
    Added,
    Removed,
}

impl ToggleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToggleAction::Added => "added",
            ToggleAction::Removed => "removed",
        }
    }
}

/// Outcome of registering an email.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    Created(User),
    /// Email was already registered; nothing changed.
    Existing(User),
}

impl Registration {
    pub fn user(&self) -> &User {
        match self {
            Registration::Created(u) | Registration::Existing(u) => u,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Registration::Created(_))
    }
}
