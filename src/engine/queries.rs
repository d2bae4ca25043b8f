use crate::model::*;
use crate::repository::UserRepository;

use super::validate::validate_email;
use super::{EngagementError, EngagementStore};

impl<R: UserRepository + ?Sized> EngagementStore<R> {
    pub async fn get_user(&self, email: &str) -> Result<User, EngagementError> {
        validate_email(email)?;
        self.repo
            .find_by_email(email)
            .await?
            .ok_or_else(|| EngagementError::UserNotFound(email.to_string()))
    }

    /// The user's bookings in repository order.
    pub async fn list_bookings(&self, email: &str) -> Result<Vec<Booking>, EngagementError> {
        validate_email(email)?;
        self.booked_visits(email).await
    }

    pub async fn list_favorites(&self, email: &str) -> Result<Vec<String>, EngagementError> {
        validate_email(email)?;
        self.favorites(email).await
    }

    async fn projection(
        &self,
        email: &str,
        fields: &[Field],
    ) -> Result<UserProjection, EngagementError> {
        self.repo
            .find_projection(email, fields)
            .await?
            .ok_or_else(|| EngagementError::UserNotFound(email.to_string()))
    }

    pub(super) async fn booked_visits(&self, email: &str) -> Result<Vec<Booking>, EngagementError> {
        let projection = self.projection(email, &[Field::BookedVisits]).await?;
        Ok(projection.booked_visits.unwrap_or_default())
    }

    pub(super) async fn favorites(&self, email: &str) -> Result<Vec<String>, EngagementError> {
        let projection = self.projection(email, &[Field::FavResidenciesId]).await?;
        Ok(projection.fav_residencies_id.unwrap_or_default())
    }
}
