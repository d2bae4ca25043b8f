use tracing::{debug, info};

use crate::limits::*;
use crate::model::*;
use crate::repository::UserRepository;

use super::validate::{validate_date, validate_email, validate_profile, validate_residency_id};
use super::{EngagementError, EngagementStore};

impl<R: UserRepository + ?Sized> EngagementStore<R> {
    /// Create the user with empty collections. Registering an email that
    /// already exists changes nothing and reports `Registration::Existing`.
    pub async fn register_user(
        &self,
        email: &str,
        name: Option<String>,
        image: Option<String>,
    ) -> Result<Registration, EngagementError> {
        validate_email(email)?;
        validate_profile(name.as_deref(), image.as_deref())?;

        let _user_lock = self.lock_user(email).await;
        if let Some(existing) = self.repo.find_by_email(email).await? {
            debug!("{email} already registered");
            return Ok(Registration::Existing(existing));
        }
        let user = self.repo.create(User::new(email, name, image)).await?;
        info!("registered user {email}");
        Ok(Registration::Created(user))
    }

    /// Append a booking unless the user already holds one for `residency_id`.
    pub async fn book_visit(
        &self,
        email: &str,
        residency_id: &str,
        date: Ms,
    ) -> Result<User, EngagementError> {
        validate_email(email)?;
        validate_residency_id(residency_id)?;
        validate_date(date)?;

        let _user_lock = self.lock_user(email).await;
        let visits = self.booked_visits(email).await?;
        if visits.iter().any(|b| b.residency_id == residency_id) {
            return Err(EngagementError::AlreadyBooked(residency_id.to_string()));
        }
        if visits.len() >= MAX_BOOKINGS_PER_USER {
            return Err(EngagementError::LimitExceeded("too many bookings"));
        }

        let patch = UserPatch::PushBooking(Booking::new(residency_id, date));
        let user = self.repo.update(email, patch).await?;
        info!("{email} booked {residency_id}");
        Ok(user)
    }

    /// Remove the booking for `residency_id`. Only the first matching entry
    /// goes; every other entry keeps its position.
    pub async fn cancel_booking(
        &self,
        email: &str,
        residency_id: &str,
    ) -> Result<User, EngagementError> {
        validate_email(email)?;
        validate_residency_id(residency_id)?;

        let _user_lock = self.lock_user(email).await;
        let mut visits = self.booked_visits(email).await?;
        let pos = visits
            .iter()
            .position(|b| b.residency_id == residency_id)
            .ok_or_else(|| EngagementError::BookingNotFound(residency_id.to_string()))?;
        visits.remove(pos);

        let user = self
            .repo
            .update(email, UserPatch::SetBookings(visits))
            .await?;
        info!("{email} cancelled booking {residency_id}");
        Ok(user)
    }

    /// Add `residency_id` to the favorites if absent, remove it if present.
    pub async fn toggle_favorite(
        &self,
        email: &str,
        residency_id: &str,
    ) -> Result<(ToggleAction, User), EngagementError> {
        validate_email(email)?;
        validate_residency_id(residency_id)?;

        let _user_lock = self.lock_user(email).await;
        let favorites = self.favorites(email).await?;

        let (action, patch) = if favorites.iter().any(|r| r == residency_id) {
            let remaining = favorites
                .into_iter()
                .filter(|r| r != residency_id)
                .collect();
            (ToggleAction::Removed, UserPatch::SetFavorites(remaining))
        } else {
            if favorites.len() >= MAX_FAVORITES_PER_USER {
                return Err(EngagementError::LimitExceeded("too many favorites"));
            }
            (
                ToggleAction::Added,
                UserPatch::PushFavorite(residency_id.to_string()),
            )
        };

        let user = self.repo.update(email, patch).await?;
        debug!("{email} favorite {residency_id}: {}", action.as_str());
        Ok((action, user))
    }
}
