/*!

This is the long-form manual for `calmar` and `calage`.

## Calibration in a nutshell

A survey gives each household unit a baseline weight. Calibration looks for
new weights, as close as possible to the baseline ones, such that the
weighted totals of some variables (the *margins*) match known targets,
for instance the number of households per region taken from a census.

The new weight of a unit is its baseline weight times a ratio `F(x·λ)`,
where `x` holds the calibration variables of the unit and `λ` is solved
for. The function `F` depends on the method:

* `linear`: `F(u) = 1 + u`, clipped to the bounds. Fast, but a weight may
  drop to the lower bound abruptly.
* `raking ratio`: `F(u) = exp(u)`, clipped to the bounds. With categorical
  margins only, this gives the same weights as iterative proportional fitting.
* `logit`: a sigmoid going from the lower to the upper bound, with `F(0) = 1`.
  Ratios always stay strictly between the bounds, which must satisfy
  `lower < 1 < upper`.

The bounds are given by `up` and `invlo`: the ratio stays within
`[1/invlo, up]`. The defaults are `up = 3` and `invlo = 3`.

The solver stops when every margin is within a relative tolerance of its
target. If it reaches the maximum number of iterations or cannot improve
the margins any more, the best weights found are kept and the outcome is
flagged as not converged.

## Margins

Categorical variables (enumerations, booleans, ages, dates) give one margin
per modality: the weighted count of the units with this modality. Other
variables give a single `total` margin: the weighted sum of the variable.

Variables are first looked up in the survey inputs, where the value of the
household head is used. If absent, they are looked up in the outputs of the
simulation, where the values of all the members of the household are
summed.

The total population is calibrated as an extra margin named `totalpop`
when it is set.

With `useProportions`, the targets of each categorical variable are read
as shares: they are rescaled so that they add up to the total population
(or to the initial total population if no target is set).

## Margin files

Targets are saved and loaded as CSV files, with one column per year:

```text
var,mod,2020
zone,1,4.5
zone,2,0.5
rent,0,120
totalpop,0,5
```

When loading a file:
- a variable that is found neither in the inputs nor in the outputs is
  skipped, with a warning,
- a variable whose modalities do not match the targets of the file is
  dropped, with a warning. With `strictTargets`, the whole file is rejected
  instead.

## The `calage` command

```text
calage --config config.json --out summary.json --weights-out weights.csv
```

The configuration is a JSON file:

```text
{
  "year": "2020",
  "inputs": { "path": "households.csv", "format": "csv" },
  "columns": { "zone": { "kind": "enum" }, "rent": { "kind": "numeric" } },
  "marginsFile": "margins.csv",
  "calibration": { "method": "raking ratio", "up": 3, "invlo": 3 }
}
```

Relative paths are resolved from the directory of the configuration file.
The survey tables may be CSV files or Excel (`.xlsx`) spreadsheets.
*/
