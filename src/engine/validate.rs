use crate::limits::*;
use crate::model::Ms;

use super::EngagementError;

pub(crate) fn validate_email(email: &str) -> Result<(), EngagementError> {
    if email.is_empty() {
        return Err(EngagementError::InvalidInput("empty email"));
    }
    if email.len() > MAX_EMAIL_LEN {
        return Err(EngagementError::LimitExceeded("email too long"));
    }
    Ok(())
}

pub(crate) fn validate_residency_id(residency_id: &str) -> Result<(), EngagementError> {
    if residency_id.is_empty() {
        return Err(EngagementError::InvalidInput("empty residency id"));
    }
    if residency_id.len() > MAX_RESIDENCY_ID_LEN {
        return Err(EngagementError::LimitExceeded("residency id too long"));
    }
    Ok(())
}

pub(crate) fn validate_date(date: Ms) -> Result<(), EngagementError> {
    if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&date) {
        return Err(EngagementError::LimitExceeded("date out of range"));
    }
    Ok(())
}

pub(crate) fn validate_profile(
    name: Option<&str>,
    image: Option<&str>,
) -> Result<(), EngagementError> {
    if name.is_some_and(|n| n.len() > MAX_NAME_LEN) {
        return Err(EngagementError::LimitExceeded("name too long"));
    }
    if image.is_some_and(|i| i.len() > MAX_IMAGE_LEN) {
        return Err(EngagementError::LimitExceeded("image url too long"));
    }
    Ok(())
}
