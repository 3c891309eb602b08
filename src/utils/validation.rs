use crate::algorithms::vncf::VncfSettings;
use crate::error::{EvncfError, Result};
use crate::models::InteractionBatch;

pub fn validate_settings(settings: &VncfSettings) -> Result<()> {
    let dimensions = [
        ("num_users", settings.num_users),
        ("num_items", settings.num_items),
        ("text_dim", settings.text_dim),
        ("embed_dim", settings.embed_dim),
        ("num_layers", settings.num_layers),
    ];
    for (name, value) in dimensions {
        if value == 0 {
            return Err(EvncfError::Configuration(format!("{} must be positive", name)));
        }
    }

    if !settings.lamb.is_finite() || settings.lamb < 0.0 {
        return Err(EvncfError::Configuration(format!(
            "lambda must be a non-negative finite number, got {}",
            settings.lamb
        )));
    }

    if !settings.learning_rate.is_finite() || settings.learning_rate <= 0.0 {
        return Err(EvncfError::Configuration(format!(
            "learning_rate must be positive, got {}",
            settings.learning_rate
        )));
    }

    Ok(())
}

pub fn validate_corruption_rate(rate: f32) -> Result<()> {
    if !(0.0..1.0).contains(&rate) {
        return Err(EvncfError::Configuration(format!(
            "corruption rate must lie in [0, 1), got {}",
            rate
        )));
    }
    Ok(())
}

pub fn validate_pairs(user_ids: &[usize], item_ids: &[usize], num_users: usize, num_items: usize) -> Result<()> {
    if user_ids.len() != item_ids.len() {
        return Err(EvncfError::shape(
            format!("{} item ids", user_ids.len()),
            item_ids.len(),
        ));
    }

    if let Some(&user) = user_ids.iter().find(|&&u| u >= num_users) {
        return Err(EvncfError::InvalidIndex(format!(
            "user {} outside {} users",
            user, num_users
        )));
    }

    if let Some(&item) = item_ids.iter().find(|&&i| i >= num_items) {
        return Err(EvncfError::InvalidIndex(format!(
            "item {} outside {} items",
            item, num_items
        )));
    }

    Ok(())
}

pub fn validate_batch(batch: &InteractionBatch, settings: &VncfSettings) -> Result<()> {
    if batch.is_empty() {
        return Err(EvncfError::ShapeMismatch("batch has no interactions".to_string()));
    }

    validate_pairs(&batch.user_ids, &batch.item_ids, settings.num_users, settings.num_items)?;

    if batch.ratings.len() != batch.len() {
        return Err(EvncfError::shape(
            format!("{} ratings", batch.len()),
            batch.ratings.len(),
        ));
    }

    if batch.keyphrases.len() != batch.len() {
        return Err(EvncfError::shape(
            format!("{} keyphrase rows", batch.len()),
            batch.keyphrases.len(),
        ));
    }

    if let Some(rating) = batch.ratings.iter().find(|r| !r.is_finite()) {
        return Err(EvncfError::NumericInstability(format!(
            "batch contains non-finite rating {}",
            rating
        )));
    }

    Ok(())
}
