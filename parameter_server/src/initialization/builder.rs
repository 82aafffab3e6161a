use std::{cell::RefCell, rc::Rc};

use comms::specs::{DistributionSpec, ParamGenSpec};
use rand::{Rng, SeedableRng, rngs::StdRng};

use super::{ChainedParamGen, ConstParamGen, ParamGen, ParamGenErr, RandParamGen, Result};

/// Boxes the `RandParamGen` matching a distribution spec.
fn resolve_distribution<R: Rng + 'static>(
    rng: Rc<RefCell<R>>,
    spec: DistributionSpec,
    limit: usize,
) -> Result<Box<dyn ParamGen>> {
    let param_gen: Box<dyn ParamGen> = match spec {
        DistributionSpec::Uniform { low, high } => {
            Box::new(RandParamGen::uniform(rng, limit, low, high)?)
        }
        DistributionSpec::UniformInclusive { low, high } => {
            Box::new(RandParamGen::uniform_inclusive(rng, limit, low, high)?)
        }
        DistributionSpec::XavierUniform { fan_in, fan_out } => {
            Box::new(RandParamGen::xavier_uniform(rng, limit, fan_in, fan_out)?)
        }
        DistributionSpec::LecunUniform { fan_in } => {
            Box::new(RandParamGen::lecun_uniform(rng, limit, fan_in)?)
        }
        DistributionSpec::Normal { mean, std_dev } => {
            Box::new(RandParamGen::normal(rng, limit, mean, std_dev)?)
        }
        DistributionSpec::Kaiming { fan_in } => {
            Box::new(RandParamGen::kaiming(rng, limit, fan_in)?)
        }
        DistributionSpec::Xavier { fan_in, fan_out } => {
            Box::new(RandParamGen::xavier(rng, limit, fan_in, fan_out)?)
        }
        DistributionSpec::Lecun { fan_in } => Box::new(RandParamGen::lecun(rng, limit, fan_in)?),
    };

    Ok(param_gen)
}

/// Resolves a parameter generator spec, sharing `rng` between every random part.
fn resolve<R: Rng + 'static>(rng: &Rc<RefCell<R>>, spec: &ParamGenSpec) -> Result<Box<dyn ParamGen>> {
    match spec {
        ParamGenSpec::Const { value, limit } => Ok(Box::new(ConstParamGen::new(*value, *limit))),
        ParamGenSpec::Rand {
            distribution,
            limit,
        } => resolve_distribution(Rc::clone(rng), *distribution, *limit),
        ParamGenSpec::Chained { specs } => {
            let param_gens = specs
                .iter()
                .map(|spec| resolve(rng, spec))
                .collect::<Result<_>>()?;

            Ok(Box::new(ChainedParamGen::new(param_gens)))
        }
    }
}

/// Generates the initial global parameter vector.
///
/// Every node calls this with the same spec and seed and gets the same vector.
///
/// # Arguments
/// * `spec` - The specification of the parameter generator.
/// * `seed` - The seed for the random parts, the os entropy is used when missing.
/// * `len` - The amount of parameters the model holds.
///
/// # Returns
/// The parameters or a `ParamGenErr` if the spec is invalid or doesn't produce `len` values.
pub fn generate(spec: &ParamGenSpec, seed: Option<u64>, len: usize) -> Result<Vec<f32>> {
    let rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };

    let rng = Rc::new(RefCell::new(rng));
    let params = resolve(&rng, spec)?.collect_all();

    if params.len() != len {
        return Err(ParamGenErr::Length {
            expected: len,
            got: params.len(),
        });
    }

    Ok(params)
}
