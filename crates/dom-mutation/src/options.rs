use crate::engine::MutationError;
use crate::receiver::ReceiverConfig;

/// Observation options dictionary.
///
/// `Option<bool>` fields distinguish "explicitly passed" from "defaulted",
/// which the validation and implicit-enabling rules depend on: requesting
/// `attribute_old_value` or an `attribute_filter` without touching
/// `attributes` implies `attributes = true`, while combining them with an
/// explicit `attributes = false` is an error. Same pattern for
/// `character_data` / `character_data_old_value`.
#[derive(Clone, Debug, Default)]
pub struct ObserveOptions {
    pub child_list: bool,
    pub attributes: Option<bool>,
    pub character_data: Option<bool>,
    pub subtree: bool,
    pub attribute_old_value: Option<bool>,
    pub character_data_old_value: Option<bool>,
    pub native_anonymous_child_list: bool,
    pub animations: bool,
    pub attribute_filter: Option<Vec<String>>,
}

impl ObserveOptions {
    /// Validates and resolves the dictionary into a receiver configuration.
    /// Fails without touching any observer state.
    pub(crate) fn resolve(&self) -> Result<ReceiverConfig, MutationError> {
        let mut attributes = self.attributes.unwrap_or(false);
        let mut character_data = self.character_data.unwrap_or(false);

        if self.attributes.is_none()
            && (self.attribute_old_value.is_some() || self.attribute_filter.is_some())
        {
            attributes = true;
        }
        if self.character_data.is_none() && self.character_data_old_value.is_some() {
            character_data = true;
        }

        if !(self.child_list
            || attributes
            || character_data
            || self.animations
            || self.native_anonymous_child_list)
        {
            return Err(MutationError::NoKindsRequested);
        }
        if self.attribute_old_value == Some(true) && self.attributes == Some(false) {
            return Err(MutationError::OldValueWithoutAttributes);
        }
        if self.attribute_filter.is_some() && self.attributes == Some(false) {
            return Err(MutationError::FilterWithoutAttributes);
        }
        if self.character_data_old_value == Some(true) && self.character_data == Some(false) {
            return Err(MutationError::OldTextWithoutCharacterData);
        }

        let (attribute_filter, all_attributes) = match &self.attribute_filter {
            Some(filter) => (filter.clone(), false),
            None => (Vec::new(), true),
        };

        Ok(ReceiverConfig {
            child_list: self.child_list,
            attributes,
            character_data,
            subtree: self.subtree,
            attribute_old_value: self.attribute_old_value.unwrap_or(false),
            character_data_old_value: self.character_data_old_value.unwrap_or(false),
            native_anonymous_child_list: self.native_anonymous_child_list,
            animations: self.animations,
            attribute_filter,
            all_attributes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn old_value_implies_attributes() {
        let cfg = ObserveOptions {
            attribute_old_value: Some(true),
            ..Default::default()
        }
        .resolve()
        .unwrap();
        assert!(cfg.attributes);
        assert!(cfg.attribute_old_value);
    }

    #[test]
    fn filter_implies_attributes() {
        let cfg = ObserveOptions {
            attribute_filter: Some(vec!["class".into()]),
            ..Default::default()
        }
        .resolve()
        .unwrap();
        assert!(cfg.attributes);
        assert!(!cfg.all_attributes);
        assert_eq!(cfg.attribute_filter, vec!["class".to_string()]);
    }

    #[test]
    fn filter_with_attributes_disabled_fails() {
        let err = ObserveOptions {
            child_list: true,
            attributes: Some(false),
            attribute_filter: Some(vec!["class".into()]),
            ..Default::default()
        }
        .resolve()
        .unwrap_err();
        assert_eq!(err, MutationError::FilterWithoutAttributes);

        // With nothing else requested the no-kinds check wins.
        let err = ObserveOptions {
            attributes: Some(false),
            attribute_filter: Some(vec!["class".into()]),
            ..Default::default()
        }
        .resolve()
        .unwrap_err();
        assert_eq!(err, MutationError::NoKindsRequested);
    }

    #[test]
    fn empty_dictionary_fails() {
        let err = ObserveOptions::default().resolve().unwrap_err();
        assert_eq!(err, MutationError::NoKindsRequested);
    }

    #[test]
    fn old_text_implies_character_data() {
        let cfg = ObserveOptions {
            character_data_old_value: Some(true),
            ..Default::default()
        }
        .resolve()
        .unwrap();
        assert!(cfg.character_data);

        let err = ObserveOptions {
            child_list: true,
            character_data: Some(false),
            character_data_old_value: Some(true),
            ..Default::default()
        }
        .resolve()
        .unwrap_err();
        assert_eq!(err, MutationError::OldTextWithoutCharacterData);

        // With nothing else requested the no-kinds check wins.
        let err = ObserveOptions {
            character_data: Some(false),
            character_data_old_value: Some(true),
            ..Default::default()
        }
        .resolve()
        .unwrap_err();
        assert_eq!(err, MutationError::NoKindsRequested);
    }
}
