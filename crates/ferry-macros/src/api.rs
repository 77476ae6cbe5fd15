// #[api] proc-macro implementation
//
// One trait declares a wrapped module. Static operation descriptors, guest
// stubs and the host dispatch table are all generated from it.

use proc_macro2::{Span, TokenStream};
use quote::{format_ident, quote};
use syn::{
    Attribute, FnArg, Ident, ItemTrait, LitInt, LitStr, Pat, Result, ReturnType, TraitItem,
    TraitItemFn, Type,
};

struct ApiArgs {
    module: u32,
    name: String,
}

struct Operation {
    docs: Vec<Attribute>,
    ident: Ident,
    variant: Ident,
    params: Vec<(Ident, Type)>,
    ret: Type,
}

/// Expands the #[api] attribute macro.
///
/// Example expansion:
/// ```ignore
/// // Input:
/// #[api(module = 1, name = "user")]
/// pub trait UserApi: Send + Sync {
///     fn offset_rect(&self, rect: Ptr<Rect, InOut>, dx: i32, dy: i32) -> Bool;
/// }
///
/// // Output:
/// pub trait UserApi: Send + Sync {
///     fn offset_rect(
///         &self,
///         rect: <Ptr<Rect, InOut> as Shape>::Host,
///         dx: <i32 as Shape>::Host,
///         dy: <i32 as Shape>::Host,
///     ) -> Bool;
/// }
///
/// #[repr(u32)]
/// pub enum UserApiOp { OffsetRect = 0 }
/// impl UserApiOp {
///     pub fn descriptor(self) -> &'static OpDescriptor { ... }
///     pub fn dispatch_table<H: UserApi>(backend: Arc<H>) -> DispatchTable { ... }
/// }
///
/// pub struct UserApiStubs<T> { trap: T }
/// impl<T: SyscallTrap> UserApiStubs<T> {
///     pub fn offset_rect(&self, rect: GuestAddr, dx: i32, dy: i32) -> Bool { ... }
/// }
/// ```
pub fn expand_api(attr: TokenStream, item: ItemTrait) -> Result<TokenStream> {
    let args = parse_args(attr, &item.ident)?;

    if !item.generics.params.is_empty() || item.generics.where_clause.is_some() {
        return Err(syn::Error::new_spanned(
            &item.generics,
            "api traits cannot be generic",
        ));
    }

    let mut ops = Vec::new();
    for trait_item in &item.items {
        match trait_item {
            TraitItem::Fn(method) => ops.push(parse_operation(method)?),
            other => {
                return Err(syn::Error::new_spanned(
                    other,
                    "api traits may only contain operations",
                ))
            }
        }
    }
    if ops.is_empty() {
        return Err(syn::Error::new_spanned(
            &item.ident,
            "api trait declares no operations",
        ));
    }

    let trait_def = generate_trait(&item, &ops);
    let op_enum = generate_op_enum(&item, &args, &ops);
    let stubs = generate_stubs(&item, &ops);

    Ok(quote! {
        #trait_def
        #op_enum
        #stubs
    })
}

fn parse_args(attr: TokenStream, trait_ident: &Ident) -> Result<ApiArgs> {
    let mut module = None;
    let mut name = None;
    let parser = syn::meta::parser(|meta| {
        if meta.path.is_ident("module") {
            let lit: LitInt = meta.value()?.parse()?;
            module = Some(lit.base10_parse::<u32>()?);
            Ok(())
        } else if meta.path.is_ident("name") {
            let lit: LitStr = meta.value()?.parse()?;
            name = Some(lit.value());
            Ok(())
        } else {
            Err(meta.error("unsupported api argument, expected `module` or `name`"))
        }
    });
    syn::parse::Parser::parse2(parser, attr)?;

    let module = module.ok_or_else(|| {
        syn::Error::new(Span::call_site(), "missing module number: `#[api(module = N)]`")
    })?;
    Ok(ApiArgs {
        module,
        name: name.unwrap_or_else(|| trait_ident.to_string().to_lowercase()),
    })
}

fn parse_operation(method: &TraitItemFn) -> Result<Operation> {
    let sig = &method.sig;
    if let Some(body) = &method.default {
        return Err(syn::Error::new_spanned(
            body,
            "operations cannot have a default body",
        ));
    }
    if !sig.generics.params.is_empty() || sig.generics.where_clause.is_some() {
        return Err(syn::Error::new_spanned(
            &sig.generics,
            "operations cannot be generic",
        ));
    }
    if let Some(asyncness) = &sig.asyncness {
        return Err(syn::Error::new_spanned(
            asyncness,
            "operations cannot be async",
        ));
    }

    let mut inputs = sig.inputs.iter();
    match inputs.next() {
        Some(FnArg::Receiver(receiver))
            if receiver.reference.is_some() && receiver.mutability.is_none() => {}
        _ => {
            return Err(syn::Error::new_spanned(
                &sig.ident,
                "operations must take `&self`",
            ))
        }
    }

    let mut params = Vec::new();
    for arg in inputs {
        match arg {
            FnArg::Typed(pat_type) => match &*pat_type.pat {
                Pat::Ident(pat_ident) => {
                    params.push((pat_ident.ident.clone(), (*pat_type.ty).clone()))
                }
                other => {
                    return Err(syn::Error::new_spanned(
                        other,
                        "only simple identifiers are supported as parameters",
                    ))
                }
            },
            FnArg::Receiver(receiver) => {
                return Err(syn::Error::new_spanned(receiver, "unexpected receiver"))
            }
        }
    }

    let ret = match &sig.output {
        ReturnType::Default => syn::parse_quote!(()),
        ReturnType::Type(_, ty) => (**ty).clone(),
    };

    Ok(Operation {
        docs: method
            .attrs
            .iter()
            .filter(|attr| attr.path().is_ident("doc"))
            .cloned()
            .collect(),
        ident: sig.ident.clone(),
        variant: format_ident!("{}", camel_case(&sig.ident.to_string())),
        params,
        ret,
    })
}

fn camel_case(snake: &str) -> String {
    snake
        .split('_')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect()
}

/// Readable rendering of a type for descriptors.
fn type_name(ty: &Type) -> String {
    quote!(#ty)
        .to_string()
        .replace(" < ", "<")
        .replace("< ", "<")
        .replace(" <", "<")
        .replace(" >", ">")
        .replace(" ,", ",")
}

/// Start of each parameter's fields, and the total, as const expressions.
fn field_offsets(params: &[(Ident, Type)]) -> (Vec<TokenStream>, TokenStream) {
    let mut offsets = Vec::with_capacity(params.len());
    let mut running = quote!(0usize);
    for (_, ty) in params {
        offsets.push(running.clone());
        running = quote!(#running + <#ty as ::ferry_abi::Shape>::FIELDS);
    }
    (offsets, running)
}

fn generate_trait(item: &ItemTrait, ops: &[Operation]) -> TokenStream {
    let attrs = &item.attrs;
    let vis = &item.vis;
    let unsafety = &item.unsafety;
    let ident = &item.ident;
    let colon = &item.colon_token;
    let supertraits = &item.supertraits;

    let methods = ops.iter().map(|op| {
        let docs = &op.docs;
        let name = &op.ident;
        let ret = &op.ret;
        let names = op.params.iter().map(|(name, _)| name);
        let types = op.params.iter().map(|(_, ty)| ty);
        quote! {
            #(#docs)*
            #[allow(clippy::too_many_arguments)]
            fn #name(&self, #(#names: <#types as ::ferry_abi::Shape>::Host),*) -> #ret;
        }
    });

    quote! {
        #(#attrs)*
        #vis #unsafety trait #ident #colon #supertraits {
            #(#methods)*
        }
    }
}

fn generate_op_enum(item: &ItemTrait, args: &ApiArgs, ops: &[Operation]) -> TokenStream {
    let vis = &item.vis;
    let trait_ident = &item.ident;
    let op_enum = format_ident!("{}Op", trait_ident);
    let module = args.module;
    let module_name = &args.name;
    let count = ops.len();
    let enum_doc = format!("Operations of the `{}` module (#{}).", module_name, module);

    let variants = ops.iter().enumerate().map(|(index, op)| {
        let variant = &op.variant;
        let index = index as u32;
        quote!(#variant = #index)
    });
    let all = ops.iter().map(|op| &op.variant);
    let names = ops.iter().map(|op| {
        let variant = &op.variant;
        let name = op.ident.to_string();
        quote!(Self::#variant => #name)
    });

    let descriptors = ops.iter().enumerate().map(|(index, op)| {
        let variant = &op.variant;
        let local = index as u32;
        let name = op.ident.to_string();
        let ret = &op.ret;
        let returns = type_name(ret);
        let param_count = op.params.len();
        let (offsets, total) = field_offsets(&op.params);
        let budget = format!(
            "operation `{}` needs more call record fields than the record holds",
            name
        );
        let params = op.params.iter().zip(&offsets).map(|((param, ty), offset)| {
            let param = param.to_string();
            let shape = type_name(ty);
            quote! {
                ::ferry_abi::ParamInfo {
                    name: #param,
                    shape: #shape,
                    kind: <#ty as ::ferry_abi::Shape>::KIND,
                    direction: <#ty as ::ferry_abi::Shape>::DIRECTION,
                    offset: #offset,
                    fields: <#ty as ::ferry_abi::Shape>::FIELDS,
                }
            }
        });
        quote! {
            Self::#variant => {
                const FIELDS: usize = #total + <#ret as ::ferry_abi::ReturnValue>::FIELDS;
                const _: () = assert!(FIELDS <= ::ferry_abi::MAX_CALL_FIELDS, #budget);
                static PARAMS: [::ferry_abi::ParamInfo; #param_count] = [#(#params),*];
                static DESCRIPTOR: ::ferry_abi::OpDescriptor = ::ferry_abi::OpDescriptor {
                    module: ::ferry_abi::ModuleId(#module),
                    local: #local,
                    name: #name,
                    params: &PARAMS,
                    returns: #returns,
                    fields: FIELDS,
                };
                &DESCRIPTOR
            }
        }
    });

    let handlers = ops.iter().map(|op| {
        let variant = &op.variant;
        let method = &op.ident;
        let op_name = op.ident.to_string();
        let ret = &op.ret;
        let (offsets, total) = field_offsets(&op.params);
        let names: Vec<_> = op.params.iter().map(|(name, _)| name).collect();
        let decodes = op.params.iter().zip(&offsets).map(|((param, ty), offset)| {
            let param_name = param.to_string();
            quote! {
                let #param = match <#ty as ::ferry_abi::Shape>::decode(
                    __record.slots(#offset, <#ty as ::ferry_abi::Shape>::FIELDS),
                    __cx,
                ) {
                    Ok(value) => value,
                    Err(__err) => {
                        ::ferry_abi::__private::log::debug!(
                            "{}.{}: rejected `{}`: {}",
                            #module_name,
                            #op_name,
                            #param_name,
                            __err
                        );
                        let __fault = <#ret as ::ferry_abi::ReturnValue>::fault(&__err);
                        ::ferry_abi::ReturnValue::store(__fault, __cx, __record, #total);
                        return;
                    }
                };
            }
        });
        quote! {
            {
                let __backend = ::ferry_abi::__private::Arc::clone(&backend);
                __table.register(
                    Self::#variant.descriptor(),
                    ::ferry_abi::__private::Arc::new(
                        move |__cx: &::ferry_abi::CallContext,
                              __record: &mut ::ferry_abi::CallRecord| {
                            #(#decodes)*
                            let __result: #ret =
                                <H as #trait_ident>::#method(&*__backend, #(#names),*);
                            ::ferry_abi::ReturnValue::store(__result, __cx, __record, #total);
                        },
                    ),
                );
            }
        }
    });

    quote! {
        #[doc = #enum_doc]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u32)]
        #vis enum #op_enum {
            #(#variants),*
        }

        impl #op_enum {
            pub const MODULE: ::ferry_abi::ModuleId = ::ferry_abi::ModuleId(#module);
            pub const NAME: &'static str = #module_name;
            pub const COUNT: usize = #count;
            pub const ALL: [Self; #count] = [#(Self::#all),*];

            pub const fn tag(self) -> ::ferry_abi::OpTag {
                ::ferry_abi::OpTag::new(Self::MODULE, self as u32)
            }

            pub const fn name(self) -> &'static str {
                match self {
                    #(#names),*
                }
            }

            pub fn descriptor(self) -> &'static ::ferry_abi::OpDescriptor {
                match self {
                    #(#descriptors)*
                }
            }

            /// Host dispatch table routing every operation to `backend`.
            pub fn dispatch_table<H>(
                backend: ::ferry_abi::__private::Arc<H>,
            ) -> ::ferry_abi::DispatchTable
            where
                H: #trait_ident + Send + Sync + 'static,
            {
                let mut __table =
                    ::ferry_abi::DispatchTable::new(Self::MODULE, Self::NAME, Self::COUNT);
                #(#handlers)*
                __table
            }
        }
    }
}

fn generate_stubs(item: &ItemTrait, ops: &[Operation]) -> TokenStream {
    let vis = &item.vis;
    let trait_ident = &item.ident;
    let op_enum = format_ident!("{}Op", trait_ident);
    let stubs = format_ident!("{}Stubs", trait_ident);
    let stubs_doc = format!(
        "Guest-side stubs for [`{}`]: pack a call record, trap once, unpack the result.",
        trait_ident
    );

    let methods = ops.iter().map(|op| {
        let docs = &op.docs;
        let name = &op.ident;
        let variant = &op.variant;
        let ret = &op.ret;
        let (offsets, total) = field_offsets(&op.params);
        let names: Vec<_> = op.params.iter().map(|(name, _)| name).collect();
        let types: Vec<_> = op.params.iter().map(|(_, ty)| ty).collect();
        let encodes = op.params.iter().zip(&offsets).map(|((param, ty), offset)| {
            quote! {
                <#ty as ::ferry_abi::Shape>::encode(
                    #param,
                    __record.slots_mut(#offset, <#ty as ::ferry_abi::Shape>::FIELDS),
                );
            }
        });
        quote! {
            #(#docs)*
            #[allow(clippy::too_many_arguments)]
            pub fn #name(
                &self,
                #(#names: <#types as ::ferry_abi::Shape>::Guest),*
            ) -> <#ret as ::ferry_abi::ReturnValue>::Guest {
                let __op = #op_enum::#variant;
                let mut __record =
                    ::ferry_abi::CallRecord::new(__op.tag(), __op.descriptor().fields);
                #(#encodes)*
                ::ferry_abi::SyscallTrap::trap(&self.trap, &mut __record);
                <#ret as ::ferry_abi::ReturnValue>::load(&__record, #total)
            }
        }
    });

    quote! {
        #[doc = #stubs_doc]
        #vis struct #stubs<T> {
            trap: T,
        }

        impl<T: ::ferry_abi::SyscallTrap> #stubs<T> {
            pub fn new(trap: T) -> Self {
                Self { trap }
            }

            pub fn trap(&self) -> &T {
                &self.trap
            }

            #(#methods)*
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_camel_case() {
        assert_eq!(camel_case("set_rect_empty"), "SetRectEmpty");
        assert_eq!(camel_case("add_ref"), "AddRef");
        assert_eq!(camel_case("polyline"), "Polyline");
    }

    #[test]
    fn test_type_name() {
        let ty: Type = syn::parse_quote!(Ptr<Rect, InOut>);
        assert_eq!(type_name(&ty), "Ptr<Rect, InOut>");
        let ty: Type = syn::parse_quote!(PtrArray<TextRun, InOut>);
        assert_eq!(type_name(&ty), "PtrArray<TextRun, InOut>");
    }

    #[test]
    fn test_rejects_missing_module() {
        let item: ItemTrait = syn::parse_quote! {
            pub trait Api { fn ping(&self) -> u32; }
        };
        let err = expand_api(TokenStream::new(), item).unwrap_err();
        assert!(err.to_string().contains("missing module number"));
    }

    #[test]
    fn test_rejects_default_body() {
        let item: ItemTrait = syn::parse_quote! {
            pub trait Api { fn ping(&self) -> u32 { 1 } }
        };
        let err = expand_api(quote!(module = 4), item).unwrap_err();
        assert!(err.to_string().contains("default body"));
    }

    #[test]
    fn test_rejects_by_value_receiver() {
        let item: ItemTrait = syn::parse_quote! {
            pub trait Api { fn ping(self) -> u32; }
        };
        let err = expand_api(quote!(module = 4), item).unwrap_err();
        assert!(err.to_string().contains("&self"));
    }

    #[test]
    fn test_expands_all_parts() {
        let item: ItemTrait = syn::parse_quote! {
            pub trait Probe: Send + Sync {
                fn ping(&self, value: u32) -> u32;
                fn fill(&self, out: Ptr<Rect, Out>) -> Bool;
            }
        };
        let tokens = expand_api(quote!(module = 4, name = "probe"), item)
            .unwrap()
            .to_string();
        assert!(tokens.contains("enum ProbeOp"));
        assert!(tokens.contains("struct ProbeStubs"));
        assert!(tokens.contains("fn dispatch_table"));
        assert!(tokens.contains("\"probe\""));
    }
}
