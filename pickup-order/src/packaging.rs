use pickup_shared::PackagingKind;

use crate::models::{DomainError, Parcel};

/// Apply one packaging kind to a parcel under construction.
///
/// Structural kinds (box, bag) are checked for exclusivity first and then
/// for weight. On error the parcel is left as it was.
pub fn apply(kind: PackagingKind, parcel: &mut Parcel) -> Result<(), DomainError> {
    if kind.is_structural() && parcel.packaging().iter().any(|p| p.is_structural()) {
        return Err(DomainError::AlreadyPackaged { requested: kind });
    }

    if let Some(max) = kind.max_weight() {
        if parcel.weight() > max {
            return Err(DomainError::TooHeavy {
                kind,
                weight: parcel.weight(),
                max,
            });
        }
    }

    let cost = parcel
        .cost()
        .checked_add(kind.surcharge())
        .ok_or(DomainError::InvalidCost(parcel.cost()))?;

    parcel.push_packaging(kind, cost);
    Ok(())
}

/// Parse packaging names as sent by front-ends ("box", "bag", "tape")
pub fn parse_codes<S: AsRef<str>>(codes: &[S]) -> Result<Vec<PackagingKind>, DomainError> {
    codes
        .iter()
        .map(|code| {
            code.as_ref()
                .parse::<PackagingKind>()
                .map_err(|_| DomainError::UnknownPackaging(code.as_ref().to_string()))
        })
        .collect()
}
