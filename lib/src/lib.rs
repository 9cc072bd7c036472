// BEGIN - Embark standard lints v0.4
// do not change or add/remove here, but one can add exceptions after this section
// for more info see: <https://github.com/EmbarkStudios/rust-ecosystem/issues/59>
#![deny(unsafe_code)]
#![warn(
    clippy::all,
    clippy::await_holding_lock,
    clippy::char_lit_as_u8,
    clippy::checked_conversions,
    clippy::dbg_macro,
    clippy::debug_assert_with_mut_call,
    clippy::doc_markdown,
    clippy::empty_enum,
    clippy::enum_glob_use,
    clippy::exit,
    clippy::expl_impl_clone_on_copy,
    clippy::explicit_deref_methods,
    clippy::explicit_into_iter_loop,
    clippy::fallible_impl_from,
    clippy::filter_map_next,
    clippy::float_cmp_const,
    clippy::fn_params_excessive_bools,
    clippy::if_let_mutex,
    clippy::implicit_clone,
    clippy::imprecise_flops,
    clippy::inefficient_to_string,
    clippy::invalid_upcast_comparisons,
    clippy::large_types_passed_by_value,
    clippy::let_unit_value,
    clippy::linkedlist,
    clippy::lossy_float_literal,
    clippy::macro_use_imports,
    clippy::manual_ok_or,
    clippy::map_err_ignore,
    clippy::map_flatten,
    clippy::map_unwrap_or,
    clippy::match_on_vec_items,
    clippy::match_same_arms,
    clippy::match_wildcard_for_single_variants,
    clippy::mem_forget,
    clippy::mismatched_target_os,
    clippy::mut_mut,
    clippy::mutex_integer,
    clippy::needless_borrow,
    clippy::needless_continue,
    clippy::option_option,
    clippy::path_buf_push_overwrite,
    clippy::ptr_as_ptr,
    clippy::ref_option_ref,
    clippy::rest_pat_in_fully_bound_structs,
    clippy::same_functions_in_if_condition,
    clippy::semicolon_if_nothing_returned,
    clippy::string_add_assign,
    clippy::string_add,
    clippy::string_lit_as_bytes,
    clippy::string_to_string,
    clippy::todo,
    clippy::trait_duplication_in_bounds,
    clippy::unimplemented,
    clippy::unnested_or_patterns,
    clippy::unused_self,
    clippy::useless_transmute,
    clippy::verbose_file_reads,
    clippy::zero_sized_map_values,
    future_incompatible,
    nonstandard_style,
    rust_2018_idioms
)]
// END - Embark standard lints v0.4

//! `restyle` turns photos into artwork in two independent ways.
//!
//! 1. Optimization based style transfer: a content image is refined with
//! L-BFGS until its features, as seen by a frozen VGG style backbone, keep
//! the content of the content image while matching the Gram matrices of a
//! style image.
//! 2. Generator inference: a photo goes through a single forward pass of a
//! pretrained ResNet generator selected by a style key.
//!
//! Both engines are built once, are immutable afterwards and can be shared
//! across threads. Each call allocates its own scratch state.
//!
//! ## Usage
//! `StyleTransfer` follows a "builder pattern" for defining parameters, while
//! `GeneratorEngine` is created from plain `GeneratorParams`. `Restyler` ties
//! both together and turns engines that fail to load into disabled features.
//!
//! ```no_run
//! let transfer = restyle::StyleTransfer::builder()
//!     .backbone_path("models/vgg19_shrunk.bin", restyle::BackboneFormat::TruncatedObject)
//!     .num_steps(50)
//!     .build()
//!     .ok();
//!
//! let restyler = restyle::Restyler::new(transfer, None);
//! let jpeg = restyler
//!     .run_style_transfer(&"imgs/style.jpg", &"imgs/content.jpg")
//!     .expect("style transfer failed");
//! std::fs::write("result.jpg", jpeg).expect("failed to save result");
//! ```
mod backbone;
pub mod codec;
pub mod device;
mod errors;
mod generator;
pub mod graph;
pub mod lbfgs;
pub mod loss;
mod optimize;
mod registry;
mod tensor;
#[cfg(test)]
mod testing;
mod transfer;
pub mod weights;

pub use image;

pub use backbone::{Backbone, BackboneFormat, FeatureLayerSpec, Layer, LayerKind};
pub use codec::{ImageSource, OutputFormat};
pub use device::{Device, DevicePreference, DeviceProbe, Resolution, Selection, SystemProbe};
pub use errors::{Engine, Error, InvalidRange, OptimizationError, UnsupportedLayer, WeightsError};
pub use generator::{GeneratorArch, ResnetGenerator};
pub use optimize::{ProgressUpdate, TransferProgress};
pub use registry::{
    resolve_model_path, GeneratorEngine, GeneratorParams, StyleDecl, StyleInfo,
    StyleRegistryEntry,
};
pub use tensor::ImageTensor;
pub use transfer::{default_styles, DefaultStyle, StyleTransfer, StyleTransferBuilder, TransferParams};

/// The engines of a process, built once at startup.
///
/// An engine that can't be built is logged and left out, the calls that
/// need it then fail with `Error::NotInitialized` while the other engine
/// keeps working.
#[derive(Debug, Default)]
pub struct Restyler {
    transfer: Option<StyleTransfer>,
    generator: Option<GeneratorEngine>,
}

impl Restyler {
    pub fn new(transfer: Option<StyleTransfer>, generator: Option<GeneratorEngine>) -> Self {
        Self {
            transfer,
            generator,
        }
    }

    /// Builds whichever engines are configured
    pub fn from_params(
        transfer: Option<&TransferParams>,
        generator: Option<&GeneratorParams>,
    ) -> Self {
        let transfer = transfer.and_then(|params| {
            match StyleTransfer::builder().params(params.clone()).build() {
                Ok(engine) => Some(engine),
                Err(err) => {
                    tracing::error!(error = %err, "style transfer is disabled, the engine failed to load");
                    None
                }
            }
        });

        let generator = generator.and_then(|params| match GeneratorEngine::new(params) {
            Ok(engine) if engine.is_usable() => Some(engine),
            Ok(_) => {
                tracing::error!("generator stylization is disabled, no style could be loaded");
                None
            }
            Err(err) => {
                tracing::error!(error = %err, "generator stylization is disabled, the engine failed to load");
                None
            }
        });

        Self::new(transfer, generator)
    }

    pub fn transfer(&self) -> Option<&StyleTransfer> {
        self.transfer.as_ref()
    }

    pub fn generator(&self) -> Option<&GeneratorEngine> {
        self.generator.as_ref()
    }

    /// Runs a full style transfer and returns the encoded result
    pub fn run_style_transfer<'a, S, C>(&self, style: S, content: C) -> Result<Vec<u8>, Error>
    where
        S: Into<ImageSource<'a>>,
        C: Into<ImageSource<'a>>,
    {
        self.transfer
            .as_ref()
            .ok_or(Error::NotInitialized(Engine::Transfer))?
            .run_encoded(style, content)
    }

    /// The styles the generator engine can apply, in declared order
    pub fn list_styles(&self) -> Vec<StyleInfo> {
        self.generator
            .as_ref()
            .map(GeneratorEngine::available_styles)
            .unwrap_or_default()
    }

    /// Applies the generator of `style_key` and returns the encoded result
    pub fn run_generator_stylize<'a, I>(&self, image: I, style_key: &str) -> Result<Vec<u8>, Error>
    where
        I: Into<ImageSource<'a>>,
    {
        self.generator
            .as_ref()
            .ok_or(Error::NotInitialized(Engine::Generator))?
            .stylize_encoded(image.into(), style_key)
    }
}
