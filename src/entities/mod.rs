// Entity Models - typed views of housing records
//
// Tenure is the authoritative record. Asset and Person each embed a copy of
// tenure fields that must be kept in step with it.

pub mod asset;
pub mod person;
pub mod tenure;

pub use asset::{Asset, AssetTenure};
pub use person::{Person, PersonTenure};
pub use tenure::{HouseholdMember, Tenure, TenureType, TenuredAsset};
