pub mod model;
pub mod store;
pub mod testing;

pub use model::{
    Collection, CollectionIdentifier, CollectionSource, CollectionSourceType, License, Package,
    PackageIdentity, PackageVersion, Product, Target,
};
pub use store::{
    CollectionStore, DatabaseLocation, PackageSearchItem, PackageSearchResult,
    SqliteCollectionStore, StoreError, TargetSearchItem, TargetSearchMode, TargetSearchPackage,
    TargetSearchResult,
};
