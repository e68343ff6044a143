use lapin::{types::AMQPValue, BasicProperties};
use std::borrow::{Borrow, Cow};

/// Convenience methods for [`lapin::BasicProperties`].
pub trait BasicPropertiesExt {
    /// Lookup header by key.
    fn get_header<Q>(&self, key: &Q) -> Option<&AMQPValue>
    where
        lapin::types::ShortString: Borrow<Q> + Ord,
        Q: Ord + ?Sized;

    /// Lookup a header string value.
    ///
    /// Returns `None` if not a string.
    fn get_header_str<Q>(&self, key: &Q) -> Option<Cow<'_, str>>
    where
        lapin::types::ShortString: Borrow<Q> + Ord,
        Q: Ord + ?Sized,
    {
        match self.get_header(key) {
            Some(AMQPValue::LongString(s)) => Some(String::from_utf8_lossy(s.as_bytes())),
            Some(AMQPValue::ShortString(s)) => Some(Cow::Borrowed(s.as_str())),
            _ => None,
        }
    }
}

impl BasicPropertiesExt for lapin::BasicProperties {
    fn get_header<Q>(&self, key: &Q) -> Option<&AMQPValue>
    where
        lapin::types::ShortString: Borrow<Q> + Ord,
        Q: Ord + ?Sized,
    {
        self.headers().as_ref()?.inner().get(key)
    }
}

/// Set the value for a header inside a collection of AMQP properties.
///
/// `properties` is consumed: `lapin` offers no mutable access to headers, so the existing ones
/// are cloned into the returned collection.
///
/// # Example
///
/// ```rust
/// use burrow::amqp::types::{AMQPValue, ShortString};
/// use burrow::amqp::{BasicProperties, convenience::set_header};
///
/// // Empty set of headers
/// let properties = BasicProperties::default();
///
/// let header_name = "x-tenant";
/// // AMQP has various string types - see https://www.rabbitmq.com/amqp-0-9-1-reference.html#domains
/// let header_value = AMQPValue::LongString(header_name.into());
///
/// // `set_header` consumes `properties` and returns the updated collection
/// let properties = set_header(properties, header_name, header_value.clone());
///
/// // Assert
/// let headers = properties.headers().as_ref().unwrap().inner();
/// let header_name: ShortString = header_name.into();
/// assert_eq!(&header_value, headers.get(&header_name).unwrap());
/// ```
pub fn set_header(
    properties: BasicProperties,
    header_name: &str,
    header_value: AMQPValue,
) -> BasicProperties {
    let mut headers = properties
        .headers()
        .as_ref()
        .map(|h| h.to_owned())
        .unwrap_or_default();
    headers.insert(header_name.into(), header_value);
    properties.with_headers(headers)
}
