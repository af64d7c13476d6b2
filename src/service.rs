//! Method descriptors and overload resolution.
//!
//! Remote methods are identified by name plus a JVM-style parameter
//! descriptor (`Ljava/lang/String;I` for `(String, int)`). When a service
//! overloads a name, the overload is picked by matching the call's argument
//! count and the JSON shape of each argument against the parameter types.
//!
//! # Example
//!
//! ```
//! use dubbo_client::service::{MethodResolver, MethodTable, ParamType, ServiceDescriptor};
//! use serde_json::json;
//!
//! let table = MethodTable::new().with_service(
//!     ServiceDescriptor::new("com.example.Greeter")
//!         .method("greet", vec![ParamType::String])
//!         .method("greet", vec![ParamType::String, ParamType::Int]),
//! );
//!
//! let method = table.resolve("com.example.Greeter", "greet", &[json!("bob"), json!(3)]).unwrap();
//! assert_eq!(method.descriptor(), "Ljava/lang/String;I");
//! ```

use std::collections::HashMap;
use std::fmt;

use serde_json::Value;

use crate::error::{Result, RpcError};

/// A parameter type as it appears in a method descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ParamType {
    Boolean,
    Byte,
    Short,
    Int,
    Long,
    Float,
    Double,
    Char,
    String,
    List,
    Map,
    /// `byte[]`
    Bytes,
    /// Array of the inner type.
    Array(Box<ParamType>),
    /// Any other class, by dotted name (`com.example.User`).
    Object(String),
}

impl ParamType {
    /// Descriptor fragment for this type.
    pub fn descriptor(&self) -> String {
        match self {
            ParamType::Boolean => "Z".to_string(),
            ParamType::Byte => "B".to_string(),
            ParamType::Short => "S".to_string(),
            ParamType::Int => "I".to_string(),
            ParamType::Long => "J".to_string(),
            ParamType::Float => "F".to_string(),
            ParamType::Double => "D".to_string(),
            ParamType::Char => "C".to_string(),
            ParamType::String => "Ljava/lang/String;".to_string(),
            ParamType::List => "Ljava/util/List;".to_string(),
            ParamType::Map => "Ljava/util/Map;".to_string(),
            ParamType::Bytes => "[B".to_string(),
            ParamType::Array(inner) => format!("[{}", inner.descriptor()),
            ParamType::Object(name) => format!("L{};", name.replace('.', "/")),
        }
    }

    /// Parse a full parameter descriptor into its types.
    ///
    /// ```
    /// use dubbo_client::service::ParamType;
    ///
    /// let types = ParamType::parse_descriptor("Ljava/lang/String;[IJ").unwrap();
    /// assert_eq!(types, vec![
    ///     ParamType::String,
    ///     ParamType::Array(Box::new(ParamType::Int)),
    ///     ParamType::Long,
    /// ]);
    /// ```
    pub fn parse_descriptor(descriptor: &str) -> Result<Vec<ParamType>> {
        let mut rest = descriptor;
        let mut types = Vec::new();
        while !rest.is_empty() {
            let (param, tail) = Self::parse_one(rest, descriptor)?;
            types.push(param);
            rest = tail;
        }
        Ok(types)
    }

    fn parse_one<'a>(input: &'a str, whole: &str) -> Result<(ParamType, &'a str)> {
        let invalid = || RpcError::Protocol(format!("invalid parameter descriptor: {}", whole));
        let mut chars = input.chars();
        let head = chars.next().ok_or_else(invalid)?;
        let tail = chars.as_str();

        let param = match head {
            'Z' => ParamType::Boolean,
            'B' => ParamType::Byte,
            'S' => ParamType::Short,
            'I' => ParamType::Int,
            'J' => ParamType::Long,
            'F' => ParamType::Float,
            'D' => ParamType::Double,
            'C' => ParamType::Char,
            '[' => {
                let (inner, tail) = Self::parse_one(tail, whole)?;
                let param = match inner {
                    ParamType::Byte => ParamType::Bytes,
                    other => ParamType::Array(Box::new(other)),
                };
                return Ok((param, tail));
            }
            'L' => {
                let end = tail.find(';').ok_or_else(invalid)?;
                let class = tail[..end].replace('/', ".");
                return Ok((Self::from_class_name(&class), &tail[end + 1..]));
            }
            _ => return Err(invalid()),
        };
        Ok((param, tail))
    }

    /// Map a dotted class name onto the closest parameter type.
    pub fn from_class_name(class: &str) -> ParamType {
        match class {
            "java.lang.String" => ParamType::String,
            "java.util.List" | "java.util.ArrayList" | "java.util.Collection" | "java.util.Set" => {
                ParamType::List
            }
            "java.util.Map" | "java.util.HashMap" => ParamType::Map,
            other => ParamType::Object(other.to_string()),
        }
    }

    /// True for JVM primitives, which never accept null.
    pub fn is_primitive(&self) -> bool {
        matches!(
            self,
            ParamType::Boolean
                | ParamType::Byte
                | ParamType::Short
                | ParamType::Int
                | ParamType::Long
                | ParamType::Float
                | ParamType::Double
                | ParamType::Char
        )
    }

    /// Whether `value` has a shape this parameter can take.
    pub fn accepts(&self, value: &Value) -> bool {
        if value.is_null() {
            return !self.is_primitive();
        }
        match self {
            ParamType::Boolean => value.is_boolean(),
            ParamType::Byte | ParamType::Short | ParamType::Int | ParamType::Long => {
                value.is_i64() || value.is_u64()
            }
            ParamType::Float | ParamType::Double => value.is_number(),
            ParamType::Char => value.as_str().is_some_and(|s| s.chars().count() == 1),
            ParamType::String => value.is_string(),
            ParamType::List => value.is_array(),
            ParamType::Map => value.is_object(),
            ParamType::Bytes => value.as_array().is_some_and(|items| {
                items
                    .iter()
                    .all(|item| item.as_u64().is_some_and(|b| b <= u8::MAX as u64))
            }),
            ParamType::Array(inner) => value
                .as_array()
                .is_some_and(|items| items.iter().all(|item| inner.accepts(item))),
            ParamType::Object(class) => match boxed_primitive(class) {
                Some(primitive) => primitive.accepts(value),
                None => value.as_object().is_some_and(|map| {
                    match map.get("$class").and_then(Value::as_str) {
                        Some(tagged) => tagged == class,
                        None => true,
                    }
                }),
            },
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamType::Boolean => f.write_str("boolean"),
            ParamType::Byte => f.write_str("byte"),
            ParamType::Short => f.write_str("short"),
            ParamType::Int => f.write_str("int"),
            ParamType::Long => f.write_str("long"),
            ParamType::Float => f.write_str("float"),
            ParamType::Double => f.write_str("double"),
            ParamType::Char => f.write_str("char"),
            ParamType::String => f.write_str("java.lang.String"),
            ParamType::List => f.write_str("java.util.List"),
            ParamType::Map => f.write_str("java.util.Map"),
            ParamType::Bytes => f.write_str("byte[]"),
            ParamType::Array(inner) => write!(f, "{}[]", inner),
            ParamType::Object(name) => f.write_str(name),
        }
    }
}

fn boxed_primitive(class: &str) -> Option<ParamType> {
    Some(match class {
        "java.lang.Boolean" => ParamType::Boolean,
        "java.lang.Byte" => ParamType::Byte,
        "java.lang.Short" => ParamType::Short,
        "java.lang.Integer" => ParamType::Int,
        "java.lang.Long" => ParamType::Long,
        "java.lang.Float" => ParamType::Float,
        "java.lang.Double" => ParamType::Double,
        "java.lang.Character" => ParamType::Char,
        _ => return None,
    })
}

/// One remote method overload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub name: String,
    pub params: Vec<ParamType>,
}

impl MethodDescriptor {
    pub fn new(name: impl Into<String>, params: Vec<ParamType>) -> Self {
        Self {
            name: name.into(),
            params,
        }
    }

    /// Concatenated parameter descriptor, as sent on the wire.
    pub fn descriptor(&self) -> String {
        self.params.iter().map(ParamType::descriptor).collect()
    }

    /// True when the argument count and every argument's shape fit.
    pub fn matches(&self, args: &[Value]) -> bool {
        self.params.len() == args.len()
            && self.params.iter().zip(args).all(|(param, arg)| param.accepts(arg))
    }
}

impl fmt::Display for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", param)?;
        }
        f.write_str(")")
    }
}

/// Picks the overload of `method` a call with `args` should use.
pub trait MethodResolver: Send + Sync + 'static {
    fn resolve(&self, service: &str, method: &str, args: &[Value]) -> Result<MethodDescriptor>;
}

/// The methods one service exposes.
#[derive(Debug, Clone, Default)]
pub struct ServiceDescriptor {
    pub name: String,
    pub methods: Vec<MethodDescriptor>,
}

impl ServiceDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: Vec::new(),
        }
    }

    /// Add an overload.
    pub fn method(mut self, name: impl Into<String>, params: Vec<ParamType>) -> Self {
        self.methods.push(MethodDescriptor::new(name, params));
        self
    }

    /// Add an overload from a descriptor string.
    pub fn method_descriptor(self, name: impl Into<String>, descriptor: &str) -> Result<Self> {
        Ok(self.method(name, ParamType::parse_descriptor(descriptor)?))
    }

    pub fn overloads<'a>(&'a self, method: &'a str) -> impl Iterator<Item = &'a MethodDescriptor> + 'a {
        self.methods.iter().filter(move |m| m.name == method)
    }
}

/// Table-backed [`MethodResolver`].
#[derive(Debug, Clone, Default)]
pub struct MethodTable {
    services: HashMap<String, ServiceDescriptor>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service(mut self, service: ServiceDescriptor) -> Self {
        self.insert(service);
        self
    }

    /// Register a service, replacing any previous descriptor of that name.
    pub fn insert(&mut self, service: ServiceDescriptor) {
        self.services.insert(service.name.clone(), service);
    }

    pub fn service(&self, name: &str) -> Option<&ServiceDescriptor> {
        self.services.get(name)
    }
}

impl MethodResolver for MethodTable {
    fn resolve(&self, service: &str, method: &str, args: &[Value]) -> Result<MethodDescriptor> {
        let not_found = || RpcError::MethodNotFound {
            service: service.to_string(),
            method: method.to_string(),
        };

        let overloads: Vec<&MethodDescriptor> = self
            .services
            .get(service)
            .map(|s| s.overloads(method).collect())
            .unwrap_or_default();

        match overloads.as_slice() {
            [] => Err(not_found()),
            [only] => Ok((*only).clone()),
            _ => {
                let matching: Vec<&MethodDescriptor> =
                    overloads.iter().copied().filter(|m| m.matches(args)).collect();
                match matching.as_slice() {
                    [] => Err(not_found()),
                    [only] => Ok((*only).clone()),
                    _ => Err(RpcError::AmbiguousMethod {
                        service: service.to_string(),
                        method: method.to_string(),
                        candidates: matching.iter().map(|m| m.to_string()).collect(),
                    }),
                }
            }
        }
    }
}
