//! Per-endpoint parameter schemas used to canonicalize raw query strings.

use std::collections::{BTreeMap, HashMap};

use super::{
    DEFAULT_LIMIT, DEFAULT_PAGE, FingerprintKey, KeyError, ParamKind, ParamValue, canonicalize,
};

/// The parameters one endpoint accepts and how each is canonicalized.
///
/// # Examples
///
/// ```
/// use std::collections::HashMap;
/// use aqcache::key::{EndpointSchema, ParamKind};
///
/// let schema = EndpointSchema::new("/v3/countries")
///     .paged()
///     .param("providers_id", ParamKind::IntList);
///
/// let params = HashMap::from([("providers_id".to_owned(), "2,1".to_owned())]);
/// let key = schema.key(&params).unwrap();
/// assert_eq!(key.pagination().unwrap().limit, 100);
/// ```
#[derive(Debug, Clone)]
pub struct EndpointSchema {
    endpoint: String,
    params: BTreeMap<String, ParamKind>,
    paged: bool,
}

impl EndpointSchema {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            params: BTreeMap::new(),
            paged: false,
        }
    }

    /// Declares a parameter.
    pub fn param(mut self, name: impl Into<String>, kind: ParamKind) -> Self {
        self.params.insert(name.into(), kind);
        self
    }

    /// Declares `limit`/`page` and fills in their defaults when a request omits them.
    pub fn paged(mut self) -> Self {
        self.paged = true;
        self.params.insert("limit".to_owned(), ParamKind::Integer);
        self.params.insert("page".to_owned(), ParamKind::Integer);
        self
    }

    /// Declares `order_by` and `sort`.
    pub fn sorted(self) -> Self {
        self.param("order_by", ParamKind::Keyword)
            .param("sort", ParamKind::Keyword)
    }

    /// Declares `coordinates`, `radius` and `bbox`.
    pub fn spatial(self) -> Self {
        self.param("coordinates", ParamKind::Coordinates)
            .param("radius", ParamKind::Integer)
            .param("bbox", ParamKind::Bbox)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn is_paged(&self) -> bool {
        self.paged
    }

    /// Declared parameters and their kinds, by name.
    pub fn params(&self) -> impl Iterator<Item = (&str, ParamKind)> {
        self.params.iter().map(|(name, kind)| (name.as_str(), *kind))
    }

    /// Canonicalizes `params` and builds the request's key.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError`] for undeclared parameters, malformed values, or a
    /// non-positive `limit`/`page` on a paged endpoint.
    pub fn key(&self, params: &HashMap<String, String>) -> Result<FingerprintKey, KeyError> {
        let mut canonical = BTreeMap::new();

        for (name, raw) in params {
            let name = name.trim();
            let kind = *self
                .params
                .get(name)
                .ok_or_else(|| KeyError::UnknownParameter {
                    endpoint: self.endpoint.clone(),
                    name: name.to_owned(),
                })?;
            if let Some(value) = canonicalize(name, kind, raw)? {
                canonical.insert(name.to_owned(), value);
            }
        }

        if self.paged {
            for (name, default) in [("limit", DEFAULT_LIMIT), ("page", DEFAULT_PAGE)] {
                let value = canonical
                    .entry(name.to_owned())
                    .or_insert_with(|| ParamValue::Number(default.to_string()));
                if !value.as_i64().is_some_and(|n| n > 0 && n <= i64::from(u32::MAX)) {
                    return Err(KeyError::InvalidValue {
                        name: name.to_owned(),
                        value: value.as_text(),
                        expected: ParamKind::Integer,
                    });
                }
            }
        }

        Ok(FingerprintKey::new(&self.endpoint, canonical))
    }
}

// Single-resource route keyed by its integer id.
fn item(endpoint: &str, id: &str) -> EndpointSchema {
    EndpointSchema::new(endpoint).param(id, ParamKind::Integer)
}

/// Endpoint → schema lookup.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<String, EndpointSchema>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a schema, replacing any previous one for the same endpoint.
    pub fn register(&mut self, schema: EndpointSchema) -> &mut Self {
        self.schemas.insert(schema.endpoint.clone(), schema);
        self
    }

    pub fn get(&self, endpoint: &str) -> Option<&EndpointSchema> {
        self.schemas.get(endpoint)
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EndpointSchema> {
        self.schemas.values()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }

    /// Schemas for the public v3 read endpoints of the air-quality API.
    pub fn openaq_v3() -> Self {
        let mut registry = Self::new();

        let filters = |schema: EndpointSchema| {
            schema
                .paged()
                .sorted()
                .spatial()
                .param("parameters_id", ParamKind::IntList)
                .param("providers_id", ParamKind::IntList)
                .param("countries_id", ParamKind::IntList)
                .param("iso", ParamKind::Keyword)
        };

        registry
            .register(
                filters(EndpointSchema::new("/v3/locations"))
                    .param("owner_contacts_id", ParamKind::IntList)
                    .param("manufacturers_id", ParamKind::IntList)
                    .param("licenses_id", ParamKind::IntList)
                    .param("mobile", ParamKind::Bool)
                    .param("monitor", ParamKind::Bool),
            )
            .register(item("/v3/locations/{locations_id}", "locations_id"))
            .register(
                EndpointSchema::new("/v3/locations/{locations_id}/latest")
                    .paged()
                    .param("locations_id", ParamKind::Integer)
                    .param("datetime_min", ParamKind::Date),
            )
            .register(
                EndpointSchema::new("/v3/locations/{locations_id}/sensors")
                    .paged()
                    .param("locations_id", ParamKind::Integer),
            )
            .register(item("/v3/sensors/{sensors_id}", "sensors_id"))
            .register(
                EndpointSchema::new("/v3/sensors/{sensors_id}/measurements")
                    .paged()
                    .param("sensors_id", ParamKind::Integer)
                    .param("date_from", ParamKind::Date)
                    .param("date_to", ParamKind::Date)
                    .param("period_name", ParamKind::Keyword),
            )
            .register(
                filters(EndpointSchema::new("/v3/parameters"))
                    .param("parameter_type", ParamKind::Keyword),
            )
            .register(item("/v3/parameters/{parameters_id}", "parameters_id"))
            .register(
                EndpointSchema::new("/v3/parameters/{parameters_id}/latest")
                    .paged()
                    .param("parameters_id", ParamKind::Integer)
                    .param("datetime_min", ParamKind::Date),
            )
            .register(
                EndpointSchema::new("/v3/countries")
                    .paged()
                    .sorted()
                    .param("parameters_id", ParamKind::IntList)
                    .param("providers_id", ParamKind::IntList),
            )
            .register(item("/v3/countries/{countries_id}", "countries_id"))
            .register(filters(EndpointSchema::new("/v3/providers")))
            .register(item("/v3/providers/{providers_id}", "providers_id"));

        for (collection, id) in [
            ("owners", "owners_id"),
            ("manufacturers", "manufacturers_id"),
            ("instruments", "instruments_id"),
            ("licenses", "licenses_id"),
        ] {
            registry
                .register(EndpointSchema::new(format!("/v3/{collection}")).paged().sorted())
                .register(item(&format!("/v3/{collection}/{{{id}}}"), id));
        }

        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn default_pagination_shares_a_key() {
        let registry = SchemaRegistry::openaq_v3();
        let schema = registry.get("/v3/locations").unwrap();
        let implicit = schema.key(&params(&[("iso", "US")])).unwrap();
        let explicit = schema
            .key(&params(&[("iso", "us"), ("page", "1"), ("limit", "100")]))
            .unwrap();
        assert_eq!(implicit, explicit);
    }

    #[test]
    fn unknown_parameter_rejected() {
        let registry = SchemaRegistry::openaq_v3();
        let err = registry
            .get("/v3/countries")
            .unwrap()
            .key(&params(&[("flavour", "vanilla")]))
            .unwrap_err();
        assert!(matches!(err, KeyError::UnknownParameter { name, .. } if name == "flavour"));
    }

    #[test]
    fn non_positive_limit_rejected() {
        let schema = EndpointSchema::new("/v3/owners").paged();
        assert!(schema.key(&params(&[("limit", "0")])).is_err());
        assert!(schema.key(&params(&[("page", "-3")])).is_err());
    }

    #[test]
    fn unpaged_endpoint_has_no_pagination() {
        let registry = SchemaRegistry::openaq_v3();
        let key = registry
            .get("/v3/sensors/{sensors_id}")
            .unwrap()
            .key(&params(&[("sensors_id", "42")]))
            .unwrap();
        assert_eq!(key.pagination(), None);
        assert_eq!(key.param("sensors_id").and_then(|v| v.as_i64()), Some(42));
    }

    #[test]
    fn registry_covers_collection_and_item_routes() {
        let registry = SchemaRegistry::openaq_v3();
        for endpoint in [
            "/v3/licenses",
            "/v3/licenses/{licenses_id}",
            "/v3/instruments/{instruments_id}",
            "/v3/sensors/{sensors_id}/measurements",
        ] {
            assert!(registry.get(endpoint).is_some(), "missing {endpoint}");
        }
    }
}
