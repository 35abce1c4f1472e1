//! Source entity catalog
//!
//! One variant per operational source entity. The order of [`Entity::ALL`]
//! is the foreign-key dependency order (parents before children) and is what
//! the merge, history, and rollup stages iterate; extraction order is
//! unspecified.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// An operational source entity moved by the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Entity {
    Offices,
    Employees,
    Customers,
    ProductLines,
    Products,
    Orders,
    OrderDetails,
    Payments,
}

impl Entity {
    /// All entities in foreign-key dependency order
    pub const ALL: [Entity; 8] = [
        Entity::Offices,
        Entity::Employees,
        Entity::Customers,
        Entity::ProductLines,
        Entity::Products,
        Entity::Orders,
        Entity::OrderDetails,
        Entity::Payments,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Entity::Offices => "offices",
            Entity::Employees => "employees",
            Entity::Customers => "customers",
            Entity::ProductLines => "productlines",
            Entity::Products => "products",
            Entity::Orders => "orders",
            Entity::OrderDetails => "orderdetails",
            Entity::Payments => "payments",
        }
    }

    /// Table name in the operational source system
    pub fn source_table(&self) -> &'static str {
        self.name()
    }

    /// Fully-qualified staging table
    pub fn staging_table(&self) -> String {
        format!("devstage.{}", self.name())
    }

    /// Columns extracted from the source and carried through staging
    ///
    /// Every entity ends with the source change-tracking timestamps; the
    /// extractor's incremental predicate runs on `update_timestamp`.
    pub fn columns(&self) -> &'static [&'static str] {
        match self {
            Entity::Offices => &[
                "officecode",
                "city",
                "phone",
                "addressline1",
                "addressline2",
                "state",
                "country",
                "postalcode",
                "territory",
                "create_timestamp",
                "update_timestamp",
            ],
            Entity::Employees => &[
                "employeenumber",
                "lastname",
                "firstname",
                "extension",
                "email",
                "officecode",
                "reportsto",
                "jobtitle",
                "create_timestamp",
                "update_timestamp",
            ],
            Entity::Customers => &[
                "customernumber",
                "customername",
                "contactlastname",
                "contactfirstname",
                "phone",
                "addressline1",
                "addressline2",
                "city",
                "state",
                "postalcode",
                "country",
                "salesrepemployeenumber",
                "creditlimit",
                "create_timestamp",
                "update_timestamp",
            ],
            Entity::ProductLines => &[
                "productline",
                "textdescription",
                "create_timestamp",
                "update_timestamp",
            ],
            Entity::Products => &[
                "productcode",
                "productname",
                "productline",
                "productscale",
                "productvendor",
                "productdescription",
                "quantityinstock",
                "buyprice",
                "msrp",
                "create_timestamp",
                "update_timestamp",
            ],
            Entity::Orders => &[
                "ordernumber",
                "orderdate",
                "requireddate",
                "shippeddate",
                "cancelleddate",
                "status",
                "comments",
                "customernumber",
                "create_timestamp",
                "update_timestamp",
            ],
            Entity::OrderDetails => &[
                "ordernumber",
                "productcode",
                "quantityordered",
                "priceeach",
                "orderlinenumber",
                "create_timestamp",
                "update_timestamp",
            ],
            Entity::Payments => &[
                "customernumber",
                "checknumber",
                "paymentdate",
                "amount",
                "create_timestamp",
                "update_timestamp",
            ],
        }
    }

    /// Object-store key for this entity's payload in a batch
    ///
    /// Convention: `{entity}/{batch_date}/{ENTITY}.csv`
    pub fn stage_key(&self, batch_date: NaiveDate) -> String {
        format!(
            "{}/{}/{}.csv",
            self.name(),
            batch_date.format("%Y-%m-%d"),
            self.name().to_uppercase()
        )
    }
}

impl std::fmt::Display for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Entity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "offices" => Ok(Entity::Offices),
            "employees" => Ok(Entity::Employees),
            "customers" => Ok(Entity::Customers),
            "productlines" => Ok(Entity::ProductLines),
            "products" => Ok(Entity::Products),
            "orders" => Ok(Entity::Orders),
            "orderdetails" => Ok(Entity::OrderDetails),
            "payments" => Ok(Entity::Payments),
            _ => Err(format!("Unknown entity: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dependency_order_parents_first() {
        let pos = |e: Entity| Entity::ALL.iter().position(|x| *x == e).unwrap();

        // Children must come after every parent they reference.
        assert!(pos(Entity::Employees) > pos(Entity::Offices));
        assert!(pos(Entity::Customers) > pos(Entity::Employees));
        assert!(pos(Entity::Products) > pos(Entity::ProductLines));
        assert!(pos(Entity::Orders) > pos(Entity::Customers));
        assert!(pos(Entity::OrderDetails) > pos(Entity::Orders));
        assert!(pos(Entity::OrderDetails) > pos(Entity::Products));
        assert!(pos(Entity::Payments) > pos(Entity::Customers));
    }

    #[test]
    fn test_stage_key_convention() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
        assert_eq!(
            Entity::OrderDetails.stage_key(date),
            "orderdetails/2024-03-05/ORDERDETAILS.csv"
        );
    }

    #[test]
    fn test_entity_from_str() {
        assert_eq!("Orders".parse::<Entity>().unwrap(), Entity::Orders);
        assert!("warehouse".parse::<Entity>().is_err());
    }

    #[test]
    fn test_columns_end_with_change_timestamps() {
        for entity in Entity::ALL {
            let cols = entity.columns();
            let n = cols.len();
            assert_eq!(cols[n - 2], "create_timestamp", "{}", entity);
            assert_eq!(cols[n - 1], "update_timestamp", "{}", entity);
        }
    }
}
